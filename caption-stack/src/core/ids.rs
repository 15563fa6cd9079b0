//! Logical ID rules.

use crate::errors::{codes, ErrorInfo, SynthResult, SynthesisError};
use regex::Regex;
use std::sync::OnceLock;

/// Maximum length CloudFormation accepts for a logical ID.
pub const MAX_LOGICAL_ID_LEN: usize = 255;

fn logical_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9]+$").expect("logical id pattern is valid"))
}

/// Validates a logical ID.
///
/// # Errors
///
/// Returns an error if the ID is empty, too long, or not alphanumeric.
pub fn validate_logical_id(id: &str) -> SynthResult<()> {
    if id.len() > MAX_LOGICAL_ID_LEN || !logical_id_pattern().is_match(id) {
        return Err(SynthesisError::new(format!("Invalid logical ID '{id}'"))
            .with_resources(vec![id.to_string()])
            .with_error_info(
                ErrorInfo::new(codes::INVALID_ID, "Logical IDs must be 1-255 alphanumeric characters")
                    .with_fix_hint("Remove separators such as '-', '_' or '.' from the ID."),
            ));
    }
    Ok(())
}

/// Builds an indexed logical ID such as `CaptionVpcPrivateSubnet1`.
#[must_use]
pub fn indexed(prefix: &str, group: &str, index: usize) -> String {
    let mut id = String::with_capacity(prefix.len() + group.len() + 4);
    id.push_str(prefix);
    id.push_str(&pascal_case(group));
    id.push_str(&(index + 1).to_string());
    id
}

/// Converts a name like `private-egress` into `PrivateEgress`.
#[must_use]
pub fn pascal_case(name: &str) -> String {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_ascii_uppercase().to_string() + chars.as_str()
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_logical_ids() {
        assert!(validate_logical_id("CaptionVpc").is_ok());
        assert!(validate_logical_id("Subnet1").is_ok());
    }

    #[test]
    fn test_invalid_logical_ids() {
        for id in ["", "caption-vpc", "a_b", "a.b", &"x".repeat(256)] {
            let err = validate_logical_id(id).unwrap_err();
            assert_eq!(err.code(), Some(codes::INVALID_ID), "id: {id}");
        }
    }

    #[test]
    fn test_indexed_ids() {
        assert_eq!(indexed("CaptionVpc", "public", 0), "CaptionVpcPublic1");
        assert_eq!(indexed("CaptionVpc", "private-egress", 1), "CaptionVpcPrivateEgress2");
    }

    #[test]
    fn test_pascal_case() {
        assert_eq!(pascal_case("train_images"), "TrainImages");
        assert_eq!(pascal_case(""), "");
    }
}
