//! CloudFormation property expressions.
//!
//! An [`Expr`] is either a literal or an intrinsic function. Intrinsics are
//! how one resource reads another's identifiers, so every reference an
//! expression makes is also a dependency edge in the resource graph.

use regex::Regex;
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;
use thiserror::Error;

/// Pseudo parameters resolved by the control plane at deploy time.
pub mod pseudo {
    /// The deploying account.
    pub const ACCOUNT_ID: &str = "AWS::AccountId";
    /// The deployment region.
    pub const REGION: &str = "AWS::Region";
    /// The partition (`aws`, `aws-cn`, ...).
    pub const PARTITION: &str = "AWS::Partition";
    /// The stack name.
    pub const STACK_NAME: &str = "AWS::StackName";
    /// The URL suffix for the partition.
    pub const URL_SUFFIX: &str = "AWS::URLSuffix";

    /// Returns true if the name is a pseudo parameter.
    #[must_use]
    pub fn is_pseudo(name: &str) -> bool {
        name.starts_with("AWS::")
    }
}

fn sub_variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{(!?)([A-Za-z0-9:._-]+)\}").expect("sub variable pattern is valid")
    })
}

/// A property value in a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// A string literal.
    Str(String),
    /// An integer literal.
    Int(i64),
    /// A boolean literal.
    Bool(bool),
    /// A list of expressions.
    List(Vec<Expr>),
    /// A map of expressions.
    Map(BTreeMap<String, Expr>),
    /// Raw JSON, emitted verbatim.
    Json(Value),
    /// `{"Ref": id}`: a resource's primary identifier, a parameter, or a pseudo parameter.
    Ref(String),
    /// `{"Fn::GetAtt": [id, attribute]}`.
    GetAtt {
        /// Logical ID of the resource.
        logical_id: String,
        /// Attribute name.
        attribute: String,
    },
    /// `{"Fn::Sub": template}` with `${Name}` / `${Name.Attr}` placeholders.
    Sub(String),
    /// `{"Fn::Join": [delimiter, parts]}`.
    Join {
        /// Delimiter placed between parts.
        delimiter: String,
        /// The parts to join.
        parts: Vec<Expr>,
    },
    /// `{"Fn::Select": [index, list]}`.
    Select {
        /// Index into the list.
        index: usize,
        /// The list to select from.
        list: Box<Expr>,
    },
    /// `{"Fn::GetAZs": ""}`: the zones of the deployment region.
    GetAzs,
}

impl Expr {
    /// Creates a string literal.
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self::Str(value.into())
    }

    /// Creates a `Ref`.
    #[must_use]
    pub fn reference(logical_id: impl Into<String>) -> Self {
        Self::Ref(logical_id.into())
    }

    /// Creates a `Fn::GetAtt`.
    #[must_use]
    pub fn get_att(logical_id: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self::GetAtt {
            logical_id: logical_id.into(),
            attribute: attribute.into(),
        }
    }

    /// Creates a `Fn::Sub`.
    #[must_use]
    pub fn sub(template: impl Into<String>) -> Self {
        Self::Sub(template.into())
    }

    /// Creates a `Fn::Sub` when the text has `${..}` placeholders, a literal
    /// otherwise.
    #[must_use]
    pub fn text(template: impl Into<String>) -> Self {
        let template = template.into();
        if template.contains("${") {
            Self::Sub(template)
        } else {
            Self::Str(template)
        }
    }

    /// Creates a `Fn::Join`.
    #[must_use]
    pub fn join(delimiter: impl Into<String>, parts: Vec<Self>) -> Self {
        Self::Join {
            delimiter: delimiter.into(),
            parts,
        }
    }

    /// Creates a `Fn::Select` over the region's zones.
    #[must_use]
    pub fn zone(index: usize) -> Self {
        Self::Select {
            index,
            list: Box::new(Self::GetAzs),
        }
    }

    /// Creates a map from key/value pairs.
    #[must_use]
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Self)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Creates a list.
    #[must_use]
    pub fn list(items: impl IntoIterator<Item = Self>) -> Self {
        Self::List(items.into_iter().collect())
    }

    /// Returns the literal string if this is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns a map entry if this is a map.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Collects the logical IDs this expression reads from.
    ///
    /// Pseudo parameters are not resources and are skipped.
    #[must_use]
    pub fn references(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::Str(_) | Self::Int(_) | Self::Bool(_) | Self::Json(_) | Self::GetAzs => {}
            Self::List(items) => items.iter().for_each(|e| e.collect_references(out)),
            Self::Map(map) => map.values().for_each(|e| e.collect_references(out)),
            Self::Ref(id) => {
                if !pseudo::is_pseudo(id) {
                    out.insert(id.clone());
                }
            }
            Self::GetAtt { logical_id, .. } => {
                out.insert(logical_id.clone());
            }
            Self::Sub(template) => {
                for caps in sub_variable_pattern().captures_iter(template) {
                    if !caps[1].is_empty() {
                        continue;
                    }
                    let name = caps[2].split('.').next().unwrap_or_default();
                    if !pseudo::is_pseudo(name) {
                        out.insert(name.to_string());
                    }
                }
            }
            Self::Join { parts, .. } => parts.iter().for_each(|e| e.collect_references(out)),
            Self::Select { list, .. } => list.collect_references(out),
        }
    }

    /// Renders the expression in CloudFormation JSON form.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Str(s) => json!(s),
            Self::Int(i) => json!(i),
            Self::Bool(b) => json!(b),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Self::Json(value) => value.clone(),
            Self::Ref(id) => json!({ "Ref": id }),
            Self::GetAtt {
                logical_id,
                attribute,
            } => json!({ "Fn::GetAtt": [logical_id, attribute] }),
            Self::Sub(template) => json!({ "Fn::Sub": template }),
            Self::Join { delimiter, parts } => json!({
                "Fn::Join": [delimiter, parts.iter().map(Self::to_json).collect::<Vec<_>>()]
            }),
            Self::Select { index, list } => json!({ "Fn::Select": [index, list.to_json()] }),
            Self::GetAzs => json!({ "Fn::GetAZs": "" }),
        }
    }

    /// Resolves the expression to a concrete value.
    ///
    /// # Errors
    ///
    /// Returns an error if a referenced resource, attribute or parameter is
    /// not known to the resolver, or an intrinsic is applied to the wrong type.
    pub fn resolve(&self, resolver: &dyn Resolver) -> Result<Value, ResolveError> {
        match self {
            Self::Str(s) => Ok(json!(s)),
            Self::Int(i) => Ok(json!(i)),
            Self::Bool(b) => Ok(json!(b)),
            Self::Json(value) => Ok(value.clone()),
            Self::List(items) => items
                .iter()
                .map(|e| e.resolve(resolver))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Self::Map(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.resolve(resolver)?);
                }
                Ok(Value::Object(out))
            }
            Self::Ref(id) => resolve_name(resolver, id, None),
            Self::GetAtt {
                logical_id,
                attribute,
            } => resolve_name(resolver, logical_id, Some(attribute)),
            Self::Sub(template) => resolve_sub(resolver, template).map(Value::String),
            Self::Join { delimiter, parts } => {
                let mut pieces = Vec::with_capacity(parts.len());
                for part in parts {
                    pieces.push(expect_string(part.resolve(resolver)?, "Fn::Join")?);
                }
                Ok(Value::String(pieces.join(delimiter)))
            }
            Self::Select { index, list } => match list.resolve(resolver)? {
                Value::Array(items) => items
                    .get(*index)
                    .cloned()
                    .ok_or(ResolveError::IndexOutOfRange(*index)),
                other => Err(ResolveError::TypeMismatch {
                    function: "Fn::Select".to_string(),
                    found: other.to_string(),
                }),
            },
            Self::GetAzs => Ok(Value::Array(
                resolver.availability_zones().into_iter().map(Value::String).collect(),
            )),
        }
    }
}

fn resolve_name(
    resolver: &dyn Resolver,
    name: &str,
    attribute: Option<&str>,
) -> Result<Value, ResolveError> {
    if pseudo::is_pseudo(name) {
        return resolver
            .pseudo_parameter(name)
            .map(Value::String)
            .ok_or_else(|| ResolveError::UnknownReference(name.to_string()));
    }
    match attribute {
        None => resolver
            .reference(name)
            .ok_or_else(|| ResolveError::UnknownReference(name.to_string())),
        Some(attr) => resolver.attribute(name, attr).ok_or_else(|| ResolveError::UnknownAttribute {
            logical_id: name.to_string(),
            attribute: attr.to_string(),
        }),
    }
}

fn resolve_sub(resolver: &dyn Resolver, template: &str) -> Result<String, ResolveError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in sub_variable_pattern().captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        last = whole.end();

        if !caps[1].is_empty() {
            out.push_str("${");
            out.push_str(&caps[2]);
            out.push('}');
            continue;
        }
        let var = &caps[2];
        let value = match var.split_once('.') {
            Some((id, attr)) if !pseudo::is_pseudo(var) => resolve_name(resolver, id, Some(attr))?,
            _ => resolve_name(resolver, var, None)?,
        };
        out.push_str(&expect_string(value, "Fn::Sub")?);
    }
    out.push_str(&template[last..]);
    Ok(out)
}

fn expect_string(value: Value, function: &str) -> Result<String, ResolveError> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(ResolveError::TypeMismatch {
            function: function.to_string(),
            found: other.to_string(),
        }),
    }
}

impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<&str> for Expr {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Expr {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for Expr {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for Expr {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Supplies the deploy-time values intrinsics resolve to.
pub trait Resolver {
    /// Returns the value of a pseudo parameter.
    fn pseudo_parameter(&self, name: &str) -> Option<String>;

    /// Returns the `Ref` value of a resource or template parameter.
    fn reference(&self, logical_id: &str) -> Option<Value>;

    /// Returns a resource attribute.
    fn attribute(&self, logical_id: &str, attribute: &str) -> Option<Value>;

    /// Returns the availability zones of the region.
    fn availability_zones(&self) -> Vec<String>;
}

/// Errors raised while resolving an expression.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// The referenced resource or parameter does not exist (yet).
    #[error("Unresolved reference: {0}")]
    UnknownReference(String),

    /// The resource exists but does not expose the attribute.
    #[error("Unresolved attribute: {logical_id}.{attribute}")]
    UnknownAttribute {
        /// Logical ID of the resource.
        logical_id: String,
        /// Attribute name.
        attribute: String,
    },

    /// An intrinsic was applied to a value of the wrong type.
    #[error("{function} cannot use value {found}")]
    TypeMismatch {
        /// The intrinsic function.
        function: String,
        /// The offending value.
        found: String,
    },

    /// `Fn::Select` index past the end of the list.
    #[error("Fn::Select index {0} out of range")]
    IndexOutOfRange(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct FixedResolver;

    impl Resolver for FixedResolver {
        fn pseudo_parameter(&self, name: &str) -> Option<String> {
            match name {
                pseudo::ACCOUNT_ID => Some("111122223333".to_string()),
                pseudo::REGION => Some("eu-north-1".to_string()),
                pseudo::PARTITION => Some("aws".to_string()),
                _ => None,
            }
        }

        fn reference(&self, logical_id: &str) -> Option<Value> {
            (logical_id == "CaptionVpc").then(|| json!("vpc-0abc"))
        }

        fn attribute(&self, logical_id: &str, attribute: &str) -> Option<Value> {
            (logical_id == "SageMakerExecRole" && attribute == "Arn")
                .then(|| json!("arn:aws:iam::111122223333:role/exec"))
        }

        fn availability_zones(&self) -> Vec<String> {
            vec!["eu-north-1a".to_string(), "eu-north-1b".to_string()]
        }
    }

    #[test]
    fn test_to_json_intrinsics() {
        assert_eq!(Expr::reference("CaptionVpc").to_json(), json!({"Ref": "CaptionVpc"}));
        assert_eq!(
            Expr::get_att("SageMakerExecRole", "Arn").to_json(),
            json!({"Fn::GetAtt": ["SageMakerExecRole", "Arn"]})
        );
        assert_eq!(
            Expr::zone(1).to_json(),
            json!({"Fn::Select": [1, {"Fn::GetAZs": ""}]})
        );
    }

    #[test]
    fn test_references_skip_pseudo_parameters() {
        let expr = Expr::list([
            Expr::reference("AWS::Region"),
            Expr::sub("arn:${AWS::Partition}:s3:::${IngestBucket}/${Role.Arn}${!Literal}"),
            Expr::join(",", vec![Expr::get_att("Subnet0", "SubnetId")]),
        ]);
        let refs: Vec<String> = expr.references().into_iter().collect();
        assert_eq!(refs, vec!["IngestBucket", "Role", "Subnet0"]);
    }

    #[test]
    fn test_resolve_sub_and_join() {
        let sub = Expr::sub("s3://cdk-assets-${AWS::AccountId}-${AWS::Region}/model.tar.gz");
        assert_eq!(
            sub.resolve(&FixedResolver).unwrap(),
            json!("s3://cdk-assets-111122223333-eu-north-1/model.tar.gz")
        );

        let join = Expr::join(
            "",
            vec![Expr::string("{\"vpc\":\""), Expr::reference("CaptionVpc"), Expr::string("\"}")],
        );
        assert_eq!(join.resolve(&FixedResolver).unwrap(), json!("{\"vpc\":\"vpc-0abc\"}"));
    }

    #[test]
    fn test_resolve_sub_attribute_and_escape() {
        let sub = Expr::sub("${SageMakerExecRole.Arn} ${!NotAVar}");
        assert_eq!(
            sub.resolve(&FixedResolver).unwrap(),
            json!("arn:aws:iam::111122223333:role/exec ${NotAVar}")
        );
    }

    #[test]
    fn test_resolve_select_zone() {
        assert_eq!(Expr::zone(1).resolve(&FixedResolver).unwrap(), json!("eu-north-1b"));
        assert_eq!(
            Expr::zone(5).resolve(&FixedResolver),
            Err(ResolveError::IndexOutOfRange(5))
        );
    }

    #[test]
    fn test_resolve_unknown_reference() {
        let err = Expr::reference("Missing").resolve(&FixedResolver).unwrap_err();
        assert_eq!(err, ResolveError::UnknownReference("Missing".to_string()));

        let err = Expr::get_att("CaptionVpc", "CidrBlock").resolve(&FixedResolver).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownAttribute { .. }));
    }

    #[test]
    fn test_serialize_matches_to_json() {
        let expr = Expr::map([("Enabled", Expr::Bool(true)), ("Count", Expr::Int(2))]);
        let text = serde_json::to_string(&expr).unwrap();
        assert_eq!(text, r#"{"Count":2,"Enabled":true}"#);
    }
}
