//! Response transformation.
//!
//! Decodes a stub's JSON content into a message of the exact type the caller
//! expects, using the protobuf JSON mapping: fields may be named by schema
//! name or JSON name, 64-bit integers may be quoted, enums may be given by
//! name or number, and bytes are base64.

use prost_reflect::{DeserializeOptions, DynamicMessage, ReflectMessage};

/// Stub content does not fit the target message schema.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("content does not fit {message}: {source}")]
    Mismatch {
        message: String,
        source: serde_json::Error,
    },
}

/// Populate a message of `target`'s type from JSON content.
///
/// The target's previous contents are discarded. Unknown fields are
/// rejected, and on error no partially decoded message is returned.
pub fn transform(
    content: &serde_json::Value,
    target: DynamicMessage,
) -> Result<DynamicMessage, TransformError> {
    let descriptor = target.descriptor();
    let options = DeserializeOptions::new().deny_unknown_fields(true);
    DynamicMessage::deserialize_with_options(descriptor.clone(), content, &options).map_err(
        |source| TransformError::Mismatch {
            message: descriptor.full_name().to_string(),
            source,
        },
    )
}

/// Like [`transform`], parsing the content from text first.
pub fn transform_str(
    content: &str,
    target: DynamicMessage,
) -> Result<DynamicMessage, TransformError> {
    let json: serde_json::Value =
        serde_json::from_str(content).map_err(TransformError::InvalidJson)?;
    transform(&json, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockServerConfig;
    use crate::descriptor::build_pool;
    use prost_reflect::Value;
    use serde_json::json;

    fn target(name: &str) -> DynamicMessage {
        let config: MockServerConfig = serde_yaml::from_str(
            r#"
messages:
  - name: helloworld.HelloReply
    fields:
      - name: message
        type: string
  - name: demo.Account
    fields:
      - name: account_id
        type: int64
      - name: balance
        type: double
      - name: quota
        type: uint32
      - name: active
        type: bool
      - name: token
        type: bytes
      - name: tier
        type: enum
        values: {FREE: 0, PRO: 1}
      - name: labels
        type: string
        repeated: true
      - name: owner
        type: message
        message: demo.Owner
  - name: demo.Owner
    fields:
      - name: email
        type: string
"#,
        )
        .unwrap();
        let pool = build_pool(&config).unwrap();
        DynamicMessage::new(pool.get_message_by_name(name).unwrap())
    }

    fn field(message: &DynamicMessage, name: &str) -> Value {
        message.get_field_by_name(name).unwrap().into_owned()
    }

    #[test]
    fn test_simple_reply() {
        let reply = transform(&json!({"message": "Hello, Ada"}), target("helloworld.HelloReply"))
            .unwrap();
        assert_eq!(field(&reply, "message"), Value::String("Hello, Ada".to_string()));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = transform(&json!({"msg": "hi"}), target("helloworld.HelloReply")).unwrap_err();
        assert!(matches!(
            &err,
            TransformError::Mismatch { message, .. } if message == "helloworld.HelloReply"
        ));
        assert!(err.to_string().contains("msg"));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let err = transform(&json!({"message": 42}), target("helloworld.HelloReply")).unwrap_err();
        assert!(matches!(err, TransformError::Mismatch { .. }));
    }

    #[test]
    fn test_full_account() {
        let account = transform(
            &json!({
                "accountId": "9007199254740993",
                "balance": 12.5,
                "quota": 10,
                "active": true,
                "token": "aGk=",
                "tier": "PRO",
                "labels": ["a", "b"],
                "owner": {"email": "ada@example.com"}
            }),
            target("demo.Account"),
        )
        .unwrap();

        assert_eq!(field(&account, "account_id"), Value::I64(9_007_199_254_740_993));
        assert_eq!(field(&account, "balance"), Value::F64(12.5));
        assert_eq!(field(&account, "quota"), Value::U32(10));
        assert_eq!(field(&account, "active"), Value::Bool(true));
        assert_eq!(field(&account, "token").as_bytes().map(|b| b.to_vec()), Some(b"hi".to_vec()));
        assert_eq!(field(&account, "tier"), Value::EnumNumber(1));
        assert_eq!(field(&account, "labels").as_list().map(|l| l.len()), Some(2));

        let owner = field(&account, "owner");
        let owner = owner.as_message().unwrap();
        assert_eq!(
            field(owner, "email"),
            Value::String("ada@example.com".to_string())
        );
    }

    #[test]
    fn test_enum_by_number_and_unknown_name() {
        let account = transform(&json!({"tier": 1}), target("demo.Account")).unwrap();
        assert_eq!(field(&account, "tier"), Value::EnumNumber(1));

        assert!(transform(&json!({"tier": "GOLD"}), target("demo.Account")).is_err());
    }

    #[test]
    fn test_integer_range_checked() {
        assert!(transform(&json!({"quota": -1}), target("demo.Account")).is_err());
        assert!(transform(&json!({"quota": 1.5}), target("demo.Account")).is_err());
    }

    #[test]
    fn test_null_leaves_field_unset() {
        let account = transform(&json!({"owner": null, "active": true}), target("demo.Account"))
            .unwrap();
        assert!(!account.has_field_by_name("owner"));
        assert_eq!(field(&account, "active"), Value::Bool(true));
    }

    #[test]
    fn test_nested_error_reported() {
        let err = transform(&json!({"owner": {"mail": "x"}}), target("demo.Account")).unwrap_err();
        assert!(err.to_string().contains("mail"));
    }

    #[test]
    fn test_target_contents_discarded() {
        let mut previous = target("helloworld.HelloReply");
        previous.set_field_by_name("message", Value::String("stale".to_string()));
        let reply = transform(&json!({}), previous).unwrap();
        assert!(!reply.has_field_by_name("message"));
    }

    #[test]
    fn test_transform_str() {
        let reply = transform_str(r#"{"message":"hi"}"#, target("helloworld.HelloReply")).unwrap();
        assert_eq!(field(&reply, "message"), Value::String("hi".to_string()));

        let err = transform_str("{not json", target("helloworld.HelloReply")).unwrap_err();
        assert!(matches!(err, TransformError::InvalidJson(_)));

        let err = transform_str("[]", target("helloworld.HelloReply")).unwrap_err();
        assert!(matches!(err, TransformError::Mismatch { .. }));
    }
}
