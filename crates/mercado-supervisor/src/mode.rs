use std::fmt;

use crate::error::SupervisorError;

/// Environment variable marking a process as a cluster worker.
pub const ROLE_ENV: &str = "MERCADO_ROLE";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Mode {
    /// One process serves everything.
    #[default]
    Fork,
    /// A primary process supervises one worker per CPU.
    Cluster,
}

impl Mode {
    /// Absent means `Fork`. Matching ignores case.
    pub fn parse(raw: Option<&str>) -> Result<Self, SupervisorError> {
        let Some(raw) = raw else {
            return Ok(Self::Fork);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "fork" => Ok(Self::Fork),
            "cluster" => Ok(Self::Cluster),
            _ => Err(SupervisorError::InvalidMode(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fork => "fork",
            Self::Cluster => "cluster",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What this particular process does within its mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Launched directly by the user.
    Primary,
    /// Launched by a cluster primary.
    Worker,
}

impl Role {
    pub fn detect() -> Self {
        Self::from_env_value(std::env::var(ROLE_ENV).ok().as_deref())
    }

    fn from_env_value(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("worker") => Self::Worker,
            _ => Self::Primary,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Worker => "worker",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parse_table() {
        let cases = [
            (None, Some(Mode::Fork)),
            (Some("fork"), Some(Mode::Fork)),
            (Some("FORK"), Some(Mode::Fork)),
            (Some("Cluster"), Some(Mode::Cluster)),
            (Some("cLuStEr"), Some(Mode::Cluster)),
            (Some("  cluster "), Some(Mode::Cluster)),
            (Some("clusterr"), None),
            (Some(""), None),
            (Some("threads"), None),
        ];
        for (input, expected) in cases {
            let parsed = Mode::parse(input).ok();
            assert_eq!(parsed, expected, "input {input:?}");
        }
    }

    #[test]
    fn invalid_mode_keeps_raw_value() {
        let err = Mode::parse(Some("Swarm")).unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidMode(ref m) if m == "Swarm"));
        assert!(err.to_string().contains("Swarm"));
    }

    #[test]
    fn role_from_env_value() {
        assert_eq!(Role::from_env_value(None), Role::Primary);
        assert_eq!(Role::from_env_value(Some("worker")), Role::Worker);
        assert_eq!(Role::from_env_value(Some("WORKER")), Role::Worker);
        assert_eq!(Role::from_env_value(Some("primary")), Role::Primary);
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(Mode::Cluster.to_string(), "cluster");
        assert_eq!(Role::Worker.as_str(), "worker");
    }
}
