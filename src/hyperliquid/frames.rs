//! Upstream frame classification.
//!
//! Every inbound frame is `{channel, data}`. Per-user channels carry the
//! subject user somewhere in `data`; extraction probes the known spots and
//! drops the frame (with a warning) when none resolves. User keys are
//! always compared lowercased.

use serde_json::Value;
use tracing::warn;

use crate::messages::UpstreamFrame;

/// Probe order: `user`, `userAddress`, nested `clearinghouseState`, then
/// the first element of a `fills` array.
pub fn extract_user(data: &Value) -> Option<String> {
    let direct = data
        .get("user")
        .or_else(|| data.get("userAddress"))
        .and_then(Value::as_str);
    if let Some(user) = direct {
        return Some(user.to_lowercase());
    }

    let nested = data
        .get("clearinghouseState")
        .and_then(|cs| cs.get("user").or_else(|| cs.get("userAddress")))
        .and_then(Value::as_str);
    if let Some(user) = nested {
        return Some(user.to_lowercase());
    }

    data.get("fills")
        .and_then(Value::as_array)
        .and_then(|fills| fills.first())
        .and_then(|fill| fill.get("user"))
        .and_then(Value::as_str)
        .map(str::to_lowercase)
}

/// Classify one raw upstream frame into its demuxed form.
/// Returns `None` for frames that should be dropped.
pub fn classify(raw: &str) -> Option<UpstreamFrame> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to parse upstream frame: {e}");
            return None;
        }
    };

    let channel = value.get("channel").and_then(Value::as_str)?.to_string();
    let data = value.get("data").cloned().unwrap_or(Value::Null);

    match channel.as_str() {
        "allMids" => Some(UpstreamFrame::PriceAll(data)),
        "webData2" => match extract_user(&data) {
            Some(user) => Some(UpstreamFrame::AccountSnapshot { user, data }),
            None => {
                warn!("webData2 frame without resolvable user — dropped");
                None
            }
        },
        "userEvents" => match extract_user(&data) {
            Some(user) => Some(UpstreamFrame::UserEvents { user, data }),
            None => {
                warn!("userEvents frame without resolvable user — dropped");
                None
            }
        },
        "subscriptionResponse" => Some(UpstreamFrame::SubscriptionAck(data)),
        _ => Some(UpstreamFrame::Other { channel, data }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_user_probe_order() {
        assert_eq!(
            extract_user(&json!({"user": "0xAbC"})),
            Some("0xabc".to_string())
        );
        assert_eq!(
            extract_user(&json!({"userAddress": "0xDeF"})),
            Some("0xdef".to_string())
        );
        assert_eq!(
            extract_user(&json!({"clearinghouseState": {"user": "0xAA"}})),
            Some("0xaa".to_string())
        );
        assert_eq!(
            extract_user(&json!({"fills": [{"user": "0xBB", "coin": "ETH"}]})),
            Some("0xbb".to_string())
        );
        assert_eq!(extract_user(&json!({"fills": []})), None);
        assert_eq!(extract_user(&json!({})), None);
    }

    #[test]
    fn test_classify_channels() {
        let price = classify(r#"{"channel":"allMids","data":{"mids":{"ETH":"2500"}}}"#);
        assert!(matches!(price, Some(UpstreamFrame::PriceAll(_))));

        let snap = classify(
            r#"{"channel":"webData2","data":{"user":"0xAB","clearinghouseState":{}}}"#,
        );
        match snap {
            Some(UpstreamFrame::AccountSnapshot { user, .. }) => assert_eq!(user, "0xab"),
            other => panic!("unexpected: {other:?}"),
        }

        let events = classify(r#"{"channel":"userEvents","data":{"fills":[{"user":"0xCD"}]}}"#);
        assert!(matches!(
            events,
            Some(UpstreamFrame::UserEvents { .. })
        ));

        let ack = classify(r#"{"channel":"subscriptionResponse","data":{"method":"subscribe"}}"#);
        assert!(matches!(ack, Some(UpstreamFrame::SubscriptionAck(_))));

        let other = classify(r#"{"channel":"candle","data":{"t":1}}"#);
        assert!(matches!(other, Some(UpstreamFrame::Other { .. })));
    }

    #[test]
    fn test_classify_drops_unresolvable_user() {
        assert!(classify(r#"{"channel":"userEvents","data":{"fills":[]}}"#).is_none());
        assert!(classify(r#"{"channel":"webData2","data":{}}"#).is_none());
        assert!(classify("not json").is_none());
        assert!(classify(r#"{"data":{}}"#).is_none());
    }
}
