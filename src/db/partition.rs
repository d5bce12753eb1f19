use serde_json::Value;

/// Declared partition-key path for the documents container.
pub const DEFAULT_PK_PATH: &str = "/normalized_domain";

/// Control documents (jobs, sessions, stop flags) all live under one
/// well-known partition.
pub const IMPORT_PARTITION: &str = "import";

/// Whether an id names an import control artifact rather than a company.
pub fn is_import_artifact_id(id: &str) -> bool {
    id.starts_with("_import_primary_job_")
        || id.starts_with("_import_session_")
        || id.starts_with("_import_stop_")
        || id.starts_with("_import_complete_")
        || id.starts_with("_import_timeout_")
}

/// Walk a `/a/b/c` style path into a JSON document. Returns a string only
/// for scalar leaves; objects and arrays are not partition keys.
pub fn value_at_path(doc: &Value, path: &str) -> Option<String> {
    let mut cur = doc;
    let parts: Vec<&str> = path
        .split('/')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        return None;
    }
    for part in parts {
        cur = cur.get(part)?;
    }
    scalar_string(cur)
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Ranked, deduplicated list of partition-key values to try for a
/// document whose true key may be unknown or inconsistent. Order follows
/// how the key was most likely written: the container's declared path
/// first, then explicitly stored keys, then derivable fallbacks.
pub fn partition_key_candidates(
    doc: Option<&Value>,
    container_pk_path: &str,
    requested_id: &str,
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |v: Option<String>| {
        if let Some(s) = v {
            if !s.is_empty() && !out.contains(&s) {
                out.push(s);
            }
        }
    };

    if let Some(doc) = doc {
        push(value_at_path(doc, container_pk_path));
        push(doc.get("partition_key").and_then(scalar_string));
        push(doc.get("normalized_domain").and_then(scalar_string));
        push(doc.get("id").and_then(scalar_string));
    }
    push(Some(requested_id.to_string()));

    let doc_id = doc
        .and_then(|d| d.get("id"))
        .and_then(|v| v.as_str())
        .unwrap_or(requested_id);
    if is_import_artifact_id(doc_id) {
        push(Some(IMPORT_PARTITION.to_string()));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn artifact_ids_are_recognized() {
        assert!(is_import_artifact_id("_import_primary_job_abc"));
        assert!(is_import_artifact_id("_import_stop_abc"));
        assert!(is_import_artifact_id("_import_session_abc"));
        assert!(!is_import_artifact_id("acme-example-com"));
    }

    #[test]
    fn value_at_path_walks_nested_objects() {
        let doc = json!({"a": {"b": {"c": "deep"}}});
        assert_eq!(value_at_path(&doc, "/a/b/c"), Some("deep".to_string()));
        assert_eq!(value_at_path(&doc, "/a/missing"), None);
        assert_eq!(value_at_path(&doc, "/"), None);
    }

    #[test]
    fn candidates_are_ordered_and_deduped() {
        let doc = json!({
            "id": "acme-example-com",
            "partition_key": "stale-key",
            "normalized_domain": "acme.example.com",
        });
        let candidates =
            partition_key_candidates(Some(&doc), DEFAULT_PK_PATH, "acme-example-com");
        assert_eq!(
            candidates,
            vec![
                "acme.example.com".to_string(),
                "stale-key".to_string(),
                "acme-example-com".to_string(),
            ]
        );
    }

    #[test]
    fn artifact_docs_fall_back_to_import_partition() {
        let candidates = partition_key_candidates(None, DEFAULT_PK_PATH, "_import_stop_s1");
        assert_eq!(
            candidates,
            vec!["_import_stop_s1".to_string(), "import".to_string()]
        );
    }

    #[test]
    fn arrays_and_objects_are_not_keys() {
        let doc = json!({"normalized_domain": ["a", "b"], "id": "x"});
        let candidates = partition_key_candidates(Some(&doc), DEFAULT_PK_PATH, "x");
        assert_eq!(candidates, vec!["x".to_string()]);
    }
}
