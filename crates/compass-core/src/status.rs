use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a registered microservice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    #[default]
    Up,
    Down,
}

/// Status of a single running instance as published to the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    #[default]
    Up,
    Down,
    Starting,
    Testing,
    OutOfService,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Up => "UP",
            InstanceStatus::Down => "DOWN",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::Testing => "TESTING",
            InstanceStatus::OutOfService => "OUTOFSERVICE",
        }
    }

    /// Instances in this status may receive consumer traffic.
    pub fn is_serving(&self) -> bool {
        matches!(self, InstanceStatus::Up | InstanceStatus::Testing)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UP" => Ok(InstanceStatus::Up),
            "DOWN" => Ok(InstanceStatus::Down),
            "STARTING" => Ok(InstanceStatus::Starting),
            "TESTING" => Ok(InstanceStatus::Testing),
            "OUTOFSERVICE" => Ok(InstanceStatus::OutOfService),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_names() {
        let json = serde_json::to_string(&InstanceStatus::OutOfService).unwrap();
        assert_eq!(json, "\"OUTOFSERVICE\"");
        assert_eq!("testing".parse::<InstanceStatus>().unwrap(), InstanceStatus::Testing);
        assert!("sleeping".parse::<InstanceStatus>().is_err());
    }
}
