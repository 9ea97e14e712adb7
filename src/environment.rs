use std::collections::HashMap;
use std::time::Duration;

/// Variable the backup plugin reads to override its throttle window, in seconds.
pub const THROTTLE_OVERRIDE_VAR: &str = "TdiffOverwriteThrottleTimeSpan";

/// Environment variables handed to a single launch.
///
/// Values set here are applied to the child's `Command` only; the harness
/// process's own environment is left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment(HashMap<String, String>);

impl Environment {
    /// Creates a new empty environment variable set.
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Sets an environment variable in this environment set.
    ///
    /// # Examples
    /// ```
    /// use difftest::Environment;
    ///
    /// let mut env = Environment::new();
    /// env.set("TdiffOverwriteThrottleTimeSpan", "-1");
    /// assert_eq!(env.len(), 1);
    /// ```
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Extends this environment with variables from another environment.
    ///
    /// Variables in `other` overwrite variables with the same name.
    pub fn extend(&mut self, other: Environment) {
        self.0.extend(other.0);
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<HashMap<String, String>> for Environment {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

/// Throttle window the backup plugin should run with.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum ThrottleSetting {
    /// Leave the plugin's own default in place
    #[default]
    ServiceDefault,
    /// Every save produces a backup
    Disabled,
    /// Saves closer together than this produce no new artifact
    Window(Duration),
}

impl ThrottleSetting {
    /// Renders the setting as launch environment, if it overrides anything.
    pub fn to_environment(self) -> Environment {
        let mut env = Environment::new();
        match self {
            ThrottleSetting::ServiceDefault => {}
            ThrottleSetting::Disabled => env.set(THROTTLE_OVERRIDE_VAR, "-1"),
            ThrottleSetting::Window(window) => {
                env.set(THROTTLE_OVERRIDE_VAR, window.as_secs_f64().to_string())
            }
        }
        env
    }
}
