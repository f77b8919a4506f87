use crate::common::data::{BodyMatcher, HttpRequest, JsonMatchType, KeyValueTemplate};
use assert_json_diff::{assert_json_matches_no_panic, CompareMode, Config};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use jsonschema::JSONSchema;
use regex::Regex;
use serde_json::Value;
use sxd_document::{dom, parser};
use sxd_xpath::evaluate_xpath;

/// Evaluates a body matching strategy against the request body.
pub fn body_matches(matcher: &BodyMatcher, req: &HttpRequest) -> bool {
    match matcher {
        BodyMatcher::Exact { value } => req.body().to_maybe_lossy_str() == value.as_str(),
        BodyMatcher::Regex { value } => regex_matches(value, &req.body().to_maybe_lossy_str()),
        BodyMatcher::Json { value, match_type } => json_matches(value, *match_type, req.body_ref()),
        BodyMatcher::JsonSchema { value } => json_schema_matches(value, req.body_ref()),
        BodyMatcher::Xml { value } => xml_matches(value, &req.body().to_maybe_lossy_str()),
        BodyMatcher::XPath { value } => xpath_matches(value, &req.body().to_maybe_lossy_str()),
        BodyMatcher::Binary { value } => binary_matches(value, req.body_ref()),
        BodyMatcher::FormUrlEncoded { params } => form_matches(params, req.body_ref()),
    }
}

fn regex_matches(pattern: &str, body: &str) -> bool {
    // Dot-all full match, so multi-line bodies behave as a single text.
    match Regex::new(&format!("^(?s:{})$", pattern)) {
        Ok(re) => re.is_match(body),
        Err(err) => {
            tracing::warn!("invalid body regex {:?}: {}", pattern, err);
            false
        }
    }
}

fn json_matches(expected: &Value, match_type: JsonMatchType, body: &[u8]) -> bool {
    let actual: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => return false,
    };

    let mode = match match_type {
        JsonMatchType::Strict => CompareMode::Strict,
        JsonMatchType::OnlyMatchingFields => CompareMode::Inclusive,
    };

    assert_json_matches_no_panic(&actual, expected, Config::new(mode)).is_ok()
}

fn json_schema_matches(schema: &Value, body: &[u8]) -> bool {
    let instance: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => return false,
    };

    match JSONSchema::compile(schema) {
        Ok(compiled) => compiled.is_valid(&instance),
        Err(err) => {
            tracing::warn!("invalid JSON schema: {}", err);
            false
        }
    }
}

fn xml_matches(expected: &str, body: &str) -> bool {
    let expected = match parser::parse(expected) {
        Ok(package) => package,
        Err(err) => {
            tracing::warn!("invalid XML in matcher: {}", err);
            return false;
        }
    };
    let actual = match parser::parse(body) {
        Ok(package) => package,
        Err(_) => return false,
    };

    match (
        document_root_element(&expected.as_document()),
        document_root_element(&actual.as_document()),
    ) {
        (Some(expected), Some(actual)) => elements_equal(expected, actual),
        _ => false,
    }
}

fn document_root_element<'d>(doc: &dom::Document<'d>) -> Option<dom::Element<'d>> {
    doc.root().children().into_iter().find_map(|child| {
        if let dom::ChildOfRoot::Element(element) = child {
            Some(element)
        } else {
            None
        }
    })
}

/// Structural XML equality: element names, attribute sets and ordered child
/// elements must agree; text nodes are compared whitespace-trimmed.
fn elements_equal(a: dom::Element, b: dom::Element) -> bool {
    if a.name() != b.name() {
        return false;
    }

    let attr_key = |attr: &dom::Attribute| {
        (
            attr.name().namespace_uri().map(|ns| ns.to_string()),
            attr.name().local_part().to_string(),
            attr.value().to_string(),
        )
    };
    let mut attrs_a: Vec<_> = a.attributes().iter().map(attr_key).collect();
    let mut attrs_b: Vec<_> = b.attributes().iter().map(attr_key).collect();
    attrs_a.sort();
    attrs_b.sort();
    if attrs_a != attrs_b {
        return false;
    }

    let children_a = significant_children(a);
    let children_b = significant_children(b);
    if children_a.len() != children_b.len() {
        return false;
    }

    children_a
        .into_iter()
        .zip(children_b)
        .all(|(ca, cb)| match (ca, cb) {
            (XmlNode::Element(ea), XmlNode::Element(eb)) => elements_equal(ea, eb),
            (XmlNode::Text(ta), XmlNode::Text(tb)) => ta == tb,
            _ => false,
        })
}

enum XmlNode<'d> {
    Element(dom::Element<'d>),
    Text(String),
}

fn significant_children(element: dom::Element) -> Vec<XmlNode> {
    element
        .children()
        .into_iter()
        .filter_map(|child| match child {
            dom::ChildOfElement::Element(e) => Some(XmlNode::Element(e)),
            dom::ChildOfElement::Text(t) => {
                let trimmed = t.text().trim().to_string();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(XmlNode::Text(trimmed))
                }
            }
            _ => None,
        })
        .collect()
}

fn xpath_matches(expression: &str, body: &str) -> bool {
    let package = match parser::parse(body) {
        Ok(package) => package,
        Err(_) => return false,
    };
    let document = package.as_document();

    match evaluate_xpath(&document, expression) {
        Ok(value) => match value {
            sxd_xpath::Value::Boolean(b) => b,
            sxd_xpath::Value::Number(n) => n != 0.0,
            sxd_xpath::Value::String(s) => !s.is_empty(),
            sxd_xpath::Value::Nodeset(nodes) => nodes.size() > 0,
        },
        Err(err) => {
            tracing::warn!("invalid XPath expression {:?}: {}", expression, err);
            false
        }
    }
}

fn binary_matches(expected_base64: &str, body: &[u8]) -> bool {
    match BASE64.decode(expected_base64) {
        Ok(expected) => expected == body,
        Err(err) => {
            tracing::warn!("invalid base64 in binary matcher: {}", err);
            false
        }
    }
}

fn form_matches(params: &[KeyValueTemplate], body: &[u8]) -> bool {
    let pairs: Vec<(String, String)> = form_urlencoded::parse(body)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    params
        .iter()
        .all(|entry| super::entry_matches(entry, &pairs, false))
}
