use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    /// API key handed to the reasoning-model subprocess. Required at startup.
    pub ATELIER_MODEL_API_KEY: Option<&str> = None;

    /// Hard wall-clock ceiling on one user turn (model time plus tool time).
    pub ATELIER_TURN_TIMEOUT_MS: Duration = Duration::from_millis(300_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// How long a disconnected session lingers before teardown. A reconnect
    /// inside this window reuses the live agent.
    pub ATELIER_RECONNECT_GRACE_MS: Duration = Duration::from_millis(30_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Overall budget for the dev-server HTTP readiness probe.
    pub ATELIER_DEV_SERVER_READY_TIMEOUT_MS: Duration = Duration::from_millis(60_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Grace between the group TERM and the group KILL during teardown.
    pub ATELIER_CHILD_KILL_GRACE_MS: Duration = Duration::from_millis(5_000), |value| {
        value.parse().map(Duration::from_millis)
    };
}
