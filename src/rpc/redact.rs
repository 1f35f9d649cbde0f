//! Making payloads safe to log.

use std::borrow::Cow;

use serde_json::{json, Value};
use unicode_truncate::UnicodeTruncateStr;

use crate::models::Request;

/// Display width logged payloads are cropped to.
const MAX_LOG_WIDTH: usize = 300;

const MASK: &str = "******";

/// Crop `text` to [`MAX_LOG_WIDTH`] columns, marking the cut with `...`.
pub(crate) fn crop(text: &str) -> Cow<'_, str> {
    let (head, _) = text.unicode_truncate(MAX_LOG_WIDTH);
    if head.len() == text.len() {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(format!("{}...", head))
    }
}

/// Serialize `request` for logging with `pass`/`password` values masked.
pub(crate) fn mask_credentials(request: &Request) -> String {
    let mut params = Value::Array(request.params.clone());
    mask_value(&mut params);
    json!({
        "id": request.id,
        "method": request.method,
        "params": params,
    })
    .to_string()
}

fn mask_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map.iter_mut() {
                if key == "pass" || key == "password" {
                    *inner = Value::String(MASK.to_string());
                } else {
                    mask_value(inner);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(mask_value),
        _ => {}
    }
}
