use crate::config::parsed_from_env;
use reqwest::Client;
use std::time::Duration;

/// Client for catalog downloads. Only the connect phase is bounded here: bulk
/// feeds are hundreds of megabytes, so whole-request timeouts are applied per
/// request where the response is known to be small.
pub fn build_client() -> Client {
    let connect = parsed_from_env::<u64>("HTTP_CONNECT_TIMEOUT_SECS", 5, |v| *v > 0);
    Client::builder()
        .connect_timeout(Duration::from_secs(connect))
        .user_agent(concat!("cardbulk/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}

pub fn request_timeout() -> Duration {
    Duration::from_secs(parsed_from_env::<u64>("HTTP_TIMEOUT_SECS", 30, |v| *v > 0))
}
