//! Thin wrappers around `json5` and `serde` used for the service config and
//! the token database, carrying file-path context in errors.

use anyhow::Context as _;
use serde::de::DeserializeOwned;

/// Parse JSON5 text and deserialize it into a specific type.
pub fn from_str<T: DeserializeOwned>(text: &str) -> anyhow::Result<T> {
    json5::from_str(text).context("Failed to deserialize JSON5")
}

/// Parse JSON5 text and deserialize it, tagging errors with a caller-supplied
/// context string (usually the file path).
pub fn from_str_with_context<T: DeserializeOwned>(
    text: &str,
    context: impl Fn() -> String,
) -> anyhow::Result<T> {
    json5::from_str(text).with_context(|| format!("{}: JSON5 parse error", context()))
}

/// Parse JSON5 bytes and deserialize, handling UTF-8 conversion in one step.
pub fn from_slice_with_context<T: DeserializeOwned>(
    slice: &[u8],
    context: impl Fn() -> String,
) -> anyhow::Result<T> {
    let text = std::str::from_utf8(slice)
        .with_context(|| format!("{}: File is not valid UTF-8", context()))?;
    from_str_with_context(text, context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct TestStruct {
        foo: String,
        bar: i32,
    }

    #[test]
    fn from_str_with_comments() {
        let result: TestStruct = from_str(
            r#"{
            // Comment
            "foo": "hello",
            "bar": 42, // Trailing comma is fine
        }"#,
        )
        .unwrap();
        assert_eq!(
            result,
            TestStruct {
                foo: "hello".to_string(),
                bar: 42
            }
        );
    }

    #[test]
    fn from_str_missing_field() {
        let err = from_str::<TestStruct>(r#"{"foo": "hello"}"#).unwrap_err();
        assert!(err.to_string().contains("deserialize"));
    }

    #[test]
    fn context_names_the_file() {
        let err = from_str_with_context::<TestStruct>("{invalid}", || "tokens.json5".to_string())
            .unwrap_err();
        assert!(err.to_string().contains("tokens.json5"));
    }

    #[test]
    fn from_slice_rejects_invalid_utf8() {
        let err = from_slice_with_context::<TestStruct>(&[0xFF, 0xFF], || "config".to_string())
            .unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }
}
