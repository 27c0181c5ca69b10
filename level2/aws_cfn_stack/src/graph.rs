//! Dependency edges between the resources of a template.
//!
//! Cloudformation orders creation by the references between resources
//! (`Ref`, `Fn::GetAtt`, `Fn::Sub`) plus explicit `DependsOn` entries.
//! Nothing here decides an order at deploy time; it only verifies that
//! the edges we emit are complete and acyclic.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::{Error, SavedTemplate};

/// every logical id referenced anywhere inside `value`.
/// pseudo parameters (`AWS::Region`, ...) are not included.
pub fn references(value: &Value) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect(value, &mut out);
    out
}

fn collect(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect(item, out);
            }
        }
        Value::Object(map) => {
            for (key, val) in map {
                match (key.as_str(), val) {
                    ("Ref", Value::String(target)) => insert_target(target, out),
                    ("Fn::GetAtt", Value::Array(parts)) => {
                        if let Some(Value::String(target)) = parts.first() {
                            insert_target(target, out);
                        }
                        for part in parts.iter().skip(1) {
                            collect(part, out);
                        }
                    }
                    ("Fn::GetAtt", Value::String(dotted)) => {
                        if let Some((target, _)) = dotted.split_once('.') {
                            insert_target(target, out);
                        }
                    }
                    ("Fn::Sub", Value::String(template)) => sub_targets(template, &BTreeSet::new(), out),
                    ("Fn::Sub", Value::Array(parts)) => {
                        let bound: BTreeSet<String> = match parts.get(1) {
                            Some(Value::Object(vars)) => vars.keys().cloned().collect(),
                            _ => BTreeSet::new(),
                        };
                        if let Some(Value::String(template)) = parts.first() {
                            sub_targets(template, &bound, out);
                        }
                        if let Some(vars) = parts.get(1) {
                            collect(vars, out);
                        }
                    }
                    _ => collect(val, out),
                }
            }
        }
        _ => {}
    }
}

fn insert_target(target: &str, out: &mut BTreeSet<String>) {
    if !target.starts_with("AWS::") {
        out.insert(target.to_string());
    }
}

fn sub_targets(template: &str, bound: &BTreeSet<String>, out: &mut BTreeSet<String>) {
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else { break };
        let var = &after[..end];
        rest = &after[end + 1..];
        // ${!Literal} is an escape, not a reference
        if var.starts_with('!') {
            continue;
        }
        let target = var.split_once('.').map(|(t, _)| t).unwrap_or(var);
        if bound.contains(target) {
            continue;
        }
        insert_target(target, out);
    }
}

/// for every resource: the set of logical ids it must be created after.
pub fn dependency_edges(template: &SavedTemplate) -> BTreeMap<String, BTreeSet<String>> {
    template.resources.iter().map(|(name, resource)| {
        let mut deps = references(&resource.properties);
        deps.extend(resource.depends_on.iter().cloned());
        (name.clone(), deps)
    }).collect()
}

pub fn check_references(template: &SavedTemplate) -> Result<(), Error> {
    for (from, deps) in dependency_edges(template) {
        for to in deps {
            if !template.resources.contains_key(&to) {
                return Err(Error::DanglingReference { from, to });
            }
        }
    }
    for (key, output) in template.outputs.iter() {
        for to in references(&output.value) {
            if !template.resources.contains_key(&to) {
                return Err(Error::DanglingReference { from: format!("Outputs.{key}"), to });
            }
        }
    }
    Ok(())
}

/// a creation order that respects every edge. Resources that become
/// ready at the same time are ordered by name so the result is stable.
pub fn creation_order(template: &SavedTemplate) -> Result<Vec<String>, Error> {
    let edges = dependency_edges(template);
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = edges.iter().map(|(name, deps)| {
        let deps = deps.iter()
            .map(String::as_str)
            .filter(|d| template.resources.contains_key(*d))
            .collect();
        (name.as_str(), deps)
    }).collect();

    let mut order = Vec::with_capacity(remaining.len());
    loop {
        let ready: Vec<&str> = remaining.iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| *name)
            .collect();
        if ready.is_empty() {
            break;
        }
        for name in ready {
            remaining.remove(name);
            for deps in remaining.values_mut() {
                deps.remove(name);
            }
            order.push(name.to_string());
        }
    }
    if !remaining.is_empty() {
        return Err(Error::DependencyCycle(remaining.keys().map(|s| s.to_string()).collect()));
    }
    Ok(order)
}

/// true if `from` has to wait for `to`, directly or through other resources.
pub fn depends_on(template: &SavedTemplate, from: &str, to: &str) -> bool {
    let edges = dependency_edges(template);
    let mut stack = vec![from.to_string()];
    let mut seen = BTreeSet::new();
    while let Some(current) = stack.pop() {
        if !seen.insert(current.clone()) {
            continue;
        }
        if let Some(deps) = edges.get(&current) {
            if deps.contains(to) {
                return true;
            }
            stack.extend(deps.iter().cloned());
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{get_att, get_ref, sub, SavedResource};
    use serde_json::json;

    fn template(resources: &[(&str, Value, &[&str])]) -> SavedTemplate {
        let mut out = SavedTemplate::default();
        for (name, properties, depends_on) in resources {
            out.resources.insert(name.to_string(), SavedResource {
                ty: "AWS::SNS::Topic".to_string(),
                properties: properties.clone(),
                depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            });
        }
        out
    }

    #[test]
    fn finds_all_reference_forms() {
        let value = json!({
            "A": get_ref("Bucket"),
            "B": [get_att("Role", "Arn")],
            "C": { "Fn::GetAtt": "Distribution.DomainName" },
            "D": sub("arn:${AWS::Partition}:s3:::${Data}/*"),
            "E": { "Fn::Sub": ["${Api}.${Local}.${!Literal}", { "Local": get_ref("Stage") }] },
            "F": get_ref("AWS::Region"),
        });
        let refs: Vec<String> = references(&value).into_iter().collect();
        assert_eq!(refs, vec!["Api", "Bucket", "Data", "Distribution", "Role", "Stage"]);
    }

    #[test]
    fn order_puts_dependencies_first() {
        let t = template(&[
            ("Record", json!({ "Target": get_att("Distribution", "DomainName") }), &[]),
            ("Distribution", json!({ "Cert": get_ref("Certificate") }), &[]),
            ("Certificate", json!({}), &[]),
            ("Deployment", json!({}), &["Method"]),
            ("Method", json!({}), &[]),
        ]);
        let order = creation_order(&t).unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("Certificate") < pos("Distribution"));
        assert!(pos("Distribution") < pos("Record"));
        assert!(pos("Method") < pos("Deployment"));
        assert!(depends_on(&t, "Record", "Certificate"));
        assert!(!depends_on(&t, "Certificate", "Record"));
    }

    #[test]
    fn cycles_are_reported() {
        let t = template(&[
            ("A", json!({ "X": get_ref("B") }), &[]),
            ("B", json!({}), &["A"]),
            ("C", json!({}), &[]),
        ]);
        match creation_order(&t) {
            Err(Error::DependencyCycle(names)) => assert_eq!(names, vec!["A", "B"]),
            other => panic!("expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn dangling_depends_on_is_rejected() {
        let t = template(&[("A", json!({}), &["Ghost"])]);
        assert!(matches!(check_references(&t), Err(Error::DanglingReference { .. })));
    }
}
