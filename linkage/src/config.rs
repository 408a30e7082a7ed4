//! Linkage configuration.
//!
//! Tunables for the child-pointer arrays and the consistency pass, loaded
//! from environment variables.
//!
//! # Environment Variables
//!
//! - `LINKAGE_VALIDATE`: run the consistency pass after structural changes
//!   and commits (`true`/`false`, `1`/`0`; default: on in debug builds)
//! - `LINKAGE_CHILD_SHRINK_DIVISOR`: a dynamically sized child array shrinks
//!   once occupancy drops below `capacity / divisor` (default: `3`)
//!
//! # Invariants
//!
//! - `shrink_divisor >= 2`, so a shrink never lands on a capacity the next
//!   insert would immediately have to grow again

/// Configuration shared by every node's link state.
///
/// Each [`crate::ParentLinks`] carries its own copy, taken when the node
/// version is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkageConfig {
    /// Run the consistency pass from [`crate::validate`].
    pub validate: bool,
    /// Occupancy divisor below which dynamic child arrays shrink.
    pub shrink_divisor: usize,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for LinkageConfig {
    fn default() -> Self {
        Self {
            validate: cfg!(debug_assertions),
            shrink_divisor: Self::DEFAULT_SHRINK_DIVISOR,
        }
    }
}

impl LinkageConfig {
    /// Default occupancy divisor (shrink below one third).
    pub const DEFAULT_SHRINK_DIVISOR: usize = 3;
    /// Environment variable toggling the consistency pass.
    pub const VALIDATE_VAR: &'static str = "LINKAGE_VALIDATE";
    /// Environment variable holding the shrink divisor.
    pub const SHRINK_DIVISOR_VAR: &'static str = "LINKAGE_CHILD_SHRINK_DIVISOR";

    /// Load configuration from environment variables.
    ///
    /// Unset variables fall back to [`LinkageConfig::default`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `LINKAGE_VALIDATE` is set but not a boolean
    /// - `LINKAGE_CHILD_SHRINK_DIVISOR` is set but not an integer >= 2
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let validate = match lookup(Self::VALIDATE_VAR) {
            Some(value) => parse_bool(Self::VALIDATE_VAR, &value)?,
            None => defaults.validate,
        };
        let shrink_divisor = match lookup(Self::SHRINK_DIVISOR_VAR) {
            Some(value) => parse_divisor(&value)?,
            None => defaults.shrink_divisor,
        };

        Ok(Self {
            validate,
            shrink_divisor,
        })
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a boolean"),
        }),
    }
}

fn parse_divisor(value: &str) -> Result<usize, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        name: LinkageConfig::SHRINK_DIVISOR_VAR.to_string(),
        message: format!("'{value}' is not an integer >= 2"),
    };
    let divisor = value.trim().parse::<usize>().map_err(|_| invalid())?;
    if divisor < 2 {
        return Err(invalid());
    }
    Ok(divisor)
}
