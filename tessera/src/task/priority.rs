//! Scheduling priority shared by tasks, subscriptions and data loaders.
//!
//! Priorities are plain ordered integers. A task's effective priority is
//! the maximum over its active subscriptions; when no subscription is
//! active the task falls back to [`Priority::BASELINE`].
//!
//! # Example
//!
//! ```
//! use tessera::task::Priority;
//!
//! assert!(Priority::HIGH > Priority::NORMAL);
//! assert_eq!(Priority::BASELINE, Priority::NORMAL);
//! ```

// =============================================================================
// Priority Constants
// =============================================================================

/// Priority value for requests the user is actively waiting on.
pub const PRIORITY_VERY_HIGH: i32 = 100;

/// Priority value for visible, user-facing requests.
pub const PRIORITY_HIGH: i32 = 50;

/// Priority value for ordinary requests.
pub const PRIORITY_NORMAL: i32 = 0;

/// Priority value for background prefetch work.
pub const PRIORITY_LOW: i32 = -50;

/// Priority value for speculative work that may never be needed.
pub const PRIORITY_VERY_LOW: i32 = -100;

/// Request and task priority.
///
/// Higher values are more important. Custom values between the named
/// levels are allowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    /// The user is actively waiting on the result.
    pub const VERY_HIGH: Priority = Priority(PRIORITY_VERY_HIGH);

    /// Visible content.
    pub const HIGH: Priority = Priority(PRIORITY_HIGH);

    /// Default priority for requests.
    pub const NORMAL: Priority = Priority(PRIORITY_NORMAL);

    /// Background prefetching (the preheater's default).
    pub const LOW: Priority = Priority(PRIORITY_LOW);

    /// Speculative work.
    pub const VERY_LOW: Priority = Priority(PRIORITY_VERY_LOW);

    /// Effective priority of a task with no active subscriptions.
    pub const BASELINE: Priority = Priority::NORMAL;

    /// Creates a new priority with the given value.
    pub fn new(value: i32) -> Self {
        Self(value)
    }

    /// Returns the numeric priority value.
    pub fn value(&self) -> i32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::VERY_HIGH => write!(f, "VeryHigh(100)"),
            Self::HIGH => write!(f, "High(50)"),
            Self::NORMAL => write!(f, "Normal(0)"),
            Self::LOW => write!(f, "Low(-50)"),
            Self::VERY_LOW => write!(f, "VeryLow(-100)"),
            Self(v) => write!(f, "Priority({})", v),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "very-high" | "veryhigh" => Ok(Self::VERY_HIGH),
            "high" => Ok(Self::HIGH),
            "normal" => Ok(Self::NORMAL),
            "low" => Ok(Self::LOW),
            "very-low" | "verylow" => Ok(Self::VERY_LOW),
            other => other
                .parse::<i32>()
                .map(Self)
                .map_err(|_| format!("unknown priority '{}'", s)),
        }
    }
}
