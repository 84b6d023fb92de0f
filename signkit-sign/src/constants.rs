//! Session-scope methods and their relay publish options.

use signkit_lib::constants::{FIVE_MINUTES, ONE_DAY};
use signkit_lib::relay::PublishOptions;

pub const WC_SESSION_PROPOSE: &str = "wc_sessionPropose";
pub const WC_SESSION_SETTLE: &str = "wc_sessionSettle";
pub const WC_SESSION_UPDATE: &str = "wc_sessionUpdate";
pub const WC_SESSION_EXTEND: &str = "wc_sessionExtend";
pub const WC_SESSION_REQUEST: &str = "wc_sessionRequest";
pub const WC_SESSION_EVENT: &str = "wc_sessionEvent";
pub const WC_SESSION_DELETE: &str = "wc_sessionDelete";
pub const WC_SESSION_PING: &str = "wc_sessionPing";

/// Methods the engine answers on session topics.
pub const SESSION_METHODS: [&str; 7] = [
    WC_SESSION_SETTLE,
    WC_SESSION_UPDATE,
    WC_SESSION_EXTEND,
    WC_SESSION_REQUEST,
    WC_SESSION_EVENT,
    WC_SESSION_DELETE,
    WC_SESSION_PING,
];

const THIRTY_SECONDS: u64 = 30;

/// Relay ttl and tag for a session-scope request or its response.
pub fn rpc_opts(method: &str, response: bool) -> PublishOptions {
    let (ttl, request_tag) = match method {
        WC_SESSION_PROPOSE => (FIVE_MINUTES, 1100),
        WC_SESSION_SETTLE => (FIVE_MINUTES, 1102),
        WC_SESSION_UPDATE => (ONE_DAY, 1104),
        WC_SESSION_EXTEND => (ONE_DAY, 1106),
        WC_SESSION_REQUEST => (FIVE_MINUTES, 1108),
        WC_SESSION_EVENT => (FIVE_MINUTES, 1110),
        WC_SESSION_DELETE => (ONE_DAY, 1112),
        WC_SESSION_PING => (THIRTY_SECONDS, 1114),
        _ => return PublishOptions::default(),
    };
    let tag = if response { request_tag + 1 } else { request_tag };
    PublishOptions::new(ttl, tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_tag_follows_request_tag() {
        for method in SESSION_METHODS.iter().chain([&WC_SESSION_PROPOSE]) {
            let request = rpc_opts(method, false);
            let response = rpc_opts(method, true);
            assert_eq!(response.tag, request.tag + 1, "{}", method);
            assert_eq!(response.ttl, request.ttl);
        }
        assert_eq!(rpc_opts(WC_SESSION_PING, false).ttl, 30);
        assert_eq!(rpc_opts(WC_SESSION_UPDATE, false).ttl, ONE_DAY);
    }
}
