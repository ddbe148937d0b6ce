//! Console wire shapes.
//!
//! Outbound frames are broadcast to every subscribed console: one
//! `datapoint` per watched job per tick, plus one `command_result` per
//! configuration message received.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsoleReply {
    /// The aggregate rate of one job at one tick, MB/s.
    Datapoint { time: f64, rate: f64, job_id: String },
    /// Acknowledgement of one inbound configuration message.
    CommandResult {
        command: String,
        result: CommandOutcome,
    },
}

impl ConsoleReply {
    pub fn config_result(outcome: CommandOutcome) -> Self {
        ConsoleReply::CommandResult {
            command: "change_config".to_string(),
            result: outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datapoint_wire_shape() {
        let frame = ConsoleReply::Datapoint {
            time: 1700000000.5,
            rate: 123.25,
            job_id: "dd.0".into(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "datapoint");
        assert_eq!(json["job_id"], "dd.0");
        assert_eq!(json["rate"], 123.25);
    }

    #[test]
    fn command_result_wire_shape() {
        let frame = ConsoleReply::config_result(CommandOutcome::Success);
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "command_result");
        assert_eq!(json["command"], "change_config");
        assert_eq!(json["result"], "success");
    }
}
