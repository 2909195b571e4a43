use serde::{Deserialize, Serialize};

/// The three component classes monitored on every vessel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    AccessPoint,
    Dashboard,
    Server,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 3] = [
        ComponentKind::AccessPoint,
        ComponentKind::Dashboard,
        ComponentKind::Server,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::AccessPoint => "access_point",
            ComponentKind::Dashboard => "dashboard",
            ComponentKind::Server => "server",
        }
    }

    /// Human-facing label used in ticket titles and chat messages.
    pub fn display_name(self) -> &'static str {
        match self {
            ComponentKind::AccessPoint => "Access Point",
            ComponentKind::Dashboard => "Dashboard",
            ComponentKind::Server => "Server",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "access_point" => Some(ComponentKind::AccessPoint),
            "dashboard" => Some(ComponentKind::Dashboard),
            "server" => Some(ComponentKind::Server),
            _ => None,
        }
    }
}

/// Current operational state of a device or component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationalStatus {
    Up,
    Down,
    Unknown,
}

impl OperationalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationalStatus::Up => "up",
            OperationalStatus::Down => "down",
            OperationalStatus::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "up" => Some(OperationalStatus::Up),
            "down" => Some(OperationalStatus::Down),
            "unknown" => Some(OperationalStatus::Unknown),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_kind_round_trips_through_str() {
        for kind in ComponentKind::ALL {
            assert_eq!(ComponentKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ComponentKind::parse("router"), None);
    }

    #[test]
    fn serde_names_are_snake_case() {
        let json = serde_json::to_string(&ComponentKind::AccessPoint).unwrap();
        assert_eq!(json, "\"access_point\"");
        let status: OperationalStatus = serde_json::from_str("\"down\"").unwrap();
        assert_eq!(status, OperationalStatus::Down);
    }
}
