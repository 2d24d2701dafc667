use chrono::{DateTime, Utc};

use std::time::Duration;

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

pub(crate) async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await
}

/// Converts a std duration into a chrono one, saturating on overflow.
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
