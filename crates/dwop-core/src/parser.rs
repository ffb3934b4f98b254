//! Source text → ordered list of [`ParsedTask`]s with predecessor/successor
//! edges, per the `fun <name>(<params>):` grammar.
//!
//! ```text
//! fun a():
//!     print("hello")
//! fun b(x:a):
//!     use(x)
//! ```
//!
//! The parser is pure and deterministic: it never talks to a database. Code
//! blob persistence is the caller's concern, supplied via the `upload`
//! callback so this crate stays free of an object-storage dependency (the
//! storage client is an external collaborator, per the architecture's
//! component boundary).

use std::collections::HashMap;

use uuid::Uuid;

/// Errors the parser can raise. These map 1:1 to HTTP 400 at the API
/// boundary — none of them are retryable.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// A parameter wasn't of the form `local:predecessor`.
    #[error("malformed param {0:?} in task {1:?}: expected `local:predecessor`")]
    MalformedParam(String, String),

    /// A body line dedented below the first body line's indent while still
    /// remaining inside the block.
    #[error("invalid indentation in task {0:?} at line {1}")]
    InvalidIndentation(String, usize),

    /// The `upload` callback failed to persist a task's code blob.
    #[error("failed to upload code blob for task {0:?}: {1}")]
    StorageUpload(String, String),
}

/// A task as produced by the parser, before it has been assigned a
/// workflow and persisted. `pending_preds`/`status`/`attempt` are already
/// set to their initial values so the caller can hand this straight to
/// `create_workflow_with_tasks_and_outbox`.
#[derive(Debug, Clone)]
pub struct ParsedTask {
    pub task_id: Uuid,
    pub name: String,
    pub code_link: String,
    pub predecessors: Vec<String>,
    pub successors: Vec<String>,
    pub func_arg_map: HashMap<String, String>,
    pub pending_preds: i32,
}

struct Header {
    name: String,
    params: String,
    indent: usize,
}

fn leading_spaces(line: &str) -> usize {
    line.chars().take_while(|c| *c == ' ').count()
}

/// Matches a header only when `fun` starts at column 0 — an indented line
/// that looks like `fun name(...):` is body text, not a new task, mirroring
/// the Go original's `^fun\s+` anchored regex.
fn match_header(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix("fun ")?;
    let open = rest.find('(')?;
    let name = rest[..open].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    let after_open = &rest[open + 1..];
    let close = after_open.find(')')?;
    let params = &after_open[..close];
    let tail = after_open[close + 1..].trim_start();
    if !tail.starts_with(':') {
        return None;
    }
    Some((name, params))
}

/// Parse `source` into an ordered list of tasks, uploading each task's code
/// blob via `upload(task_id, code_blob) -> code_link`.
pub fn parse<F>(source: &str, mut upload: F) -> Result<Vec<ParsedTask>, ParseError>
where
    F: FnMut(Uuid, &str) -> Result<String, ParseError>,
{
    let lines: Vec<&str> = source.lines().collect();

    let mut headers = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some((name, params)) = match_header(line) {
            headers.push((
                Header {
                    name: name.to_string(),
                    params: params.to_string(),
                    indent: leading_spaces(line),
                },
                idx,
            ));
        }
    }

    let mut tasks = Vec::with_capacity(headers.len());

    for (i, (header, header_line)) in headers.iter().enumerate() {
        let next_header_line = headers
            .get(i + 1)
            .map(|(_, l)| *l)
            .unwrap_or(lines.len());

        let mut func_arg_map = HashMap::new();
        let mut predecessors = Vec::new();
        if !header.params.trim().is_empty() {
            for raw_param in header.params.split(',') {
                let param = raw_param.trim();
                if param.is_empty() {
                    continue;
                }
                let parts: Vec<&str> = param.split(':').collect();
                match parts.as_slice() {
                    [local, pred] if !local.trim().is_empty() && !pred.trim().is_empty() => {
                        let pred = pred.trim().to_string();
                        predecessors.push(pred.clone());
                        func_arg_map.insert(pred, local.trim().to_string());
                    }
                    _ => {
                        return Err(ParseError::MalformedParam(
                            param.to_string(),
                            header.name.clone(),
                        ))
                    }
                }
            }
        }

        // Collect the body: lines strictly more indented than the header,
        // stopping at the first line at or below the header's indent.
        let body_start = header_line + 1;
        let mut body_indent: Option<usize> = None;
        let mut code = String::new();

        for (offset, line) in lines[body_start..next_header_line].iter().enumerate() {
            let indent = leading_spaces(line);
            if indent <= header.indent {
                break;
            }
            let body_indent = *body_indent.get_or_insert(indent);
            if indent < body_indent {
                return Err(ParseError::InvalidIndentation(
                    header.name.clone(),
                    body_start + offset + 1,
                ));
            }
            code.push_str(&line[body_indent..]);
            code.push('\n');
        }

        let task_id = Uuid::now_v7();
        let code_link = upload(task_id, &code)?;

        let pending_preds = predecessors.len() as i32;

        tasks.push(ParsedTask {
            task_id,
            name: header.name.clone(),
            code_link,
            predecessors,
            successors: Vec::new(),
            func_arg_map,
            pending_preds,
        });
    }

    // Reverse-edge scan: for every task, append it as a successor of each
    // of its predecessors. Unknown predecessor names are left dangling —
    // this is documented behavior (see spec Open Questions), not an error.
    let names: HashMap<String, usize> = tasks
        .iter()
        .enumerate()
        .map(|(idx, t)| (t.name.clone(), idx))
        .collect();
    let edges: Vec<(usize, String)> = tasks
        .iter()
        .enumerate()
        .flat_map(|(idx, t)| t.predecessors.iter().map(move |p| (idx, p.clone())))
        .collect();
    for (successor_idx, pred_name) in edges {
        if let Some(&pred_idx) = names.get(&pred_name) {
            let successor_name = tasks[successor_idx].name.clone();
            tasks[pred_idx].successors.push(successor_name);
        }
    }

    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_upload(task_id: Uuid, code: &str) -> Result<String, ParseError> {
        Ok(format!("Task_Code/{task_id}/code@{}", code.len()))
    }

    #[test]
    fn parses_root_task_with_no_predecessors() {
        let src = "fun a():\n    print(1)\n";
        let tasks = parse(src, noop_upload).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].name, "a");
        assert!(tasks[0].predecessors.is_empty());
        assert_eq!(tasks[0].pending_preds, 0);
    }

    #[test]
    fn parses_linear_dependency_and_builds_successor_edges() {
        let src = "fun a():\n    body1\nfun b(x:a):\n    body2\n";
        let tasks = parse(src, noop_upload).unwrap();
        assert_eq!(tasks[0].name, "a");
        assert_eq!(tasks[0].successors, vec!["b".to_string()]);
        assert_eq!(tasks[1].predecessors, vec!["a".to_string()]);
        assert_eq!(tasks[1].func_arg_map.get("a"), Some(&"x".to_string()));
        assert_eq!(tasks[1].pending_preds, 1);
    }

    #[test]
    fn fan_out_and_join_sets_pending_preds_to_two() {
        let src = "fun a():\n    b1\nfun b():\n    b2\nfun c(x:a, y:b):\n    b3\n";
        let tasks = parse(src, noop_upload).unwrap();
        let c = tasks.iter().find(|t| t.name == "c").unwrap();
        assert_eq!(c.pending_preds, 2);
        assert_eq!(c.predecessors, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn two_params_referencing_same_predecessor_collapse_to_one_map_entry() {
        let src = "fun a():\n    b1\nfun b(x:a, y:a):\n    b2\n";
        let tasks = parse(src, noop_upload).unwrap();
        let b = &tasks[1];
        assert_eq!(b.predecessors, vec!["a".to_string(), "a".to_string()]);
        assert_eq!(b.func_arg_map.len(), 1);
    }

    #[test]
    fn unknown_predecessor_name_is_left_dangling_not_an_error() {
        let src = "fun b(x:ghost):\n    body\n";
        let tasks = parse(src, noop_upload).unwrap();
        assert_eq!(tasks[0].predecessors, vec!["ghost".to_string()]);
        assert_eq!(tasks[0].pending_preds, 1);
    }

    #[test]
    fn malformed_param_without_colon_is_an_error() {
        let src = "fun b(justaname):\n    body\n";
        let err = parse(src, noop_upload).unwrap_err();
        assert!(matches!(err, ParseError::MalformedParam(_, _)));
    }

    #[test]
    fn malformed_param_with_two_colons_is_an_error() {
        let src = "fun a():\n    body\nfun b(x:a:b):\n    body2\n";
        let err = parse(src, noop_upload).unwrap_err();
        assert!(matches!(err, ParseError::MalformedParam(_, _)));
    }

    #[test]
    fn dedented_body_line_within_block_is_invalid_indentation() {
        let src = "fun a():\n        deep\n    shallow\nfun b():\n    ok\n";
        let err = parse(src, noop_upload).unwrap_err();
        assert!(matches!(err, ParseError::InvalidIndentation(_, _)));
    }

    #[test]
    fn indented_fun_looking_line_stays_body_text_not_a_header() {
        let src = "fun a():\n    x = 1\n    fun b(x:a):\n    y = 2\nfun c():\n    z = 3\n";
        let tasks = parse(src, noop_upload).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].name, "a");
        assert_eq!(tasks[1].name, "c");
    }

    #[test]
    fn code_blob_strips_body_indent_and_joins_with_newlines() {
        let src = "fun a():\n    line1\n    line2\n";
        let mut captured = String::new();
        let tasks = parse(src, |_id, code| {
            captured = code.to_string();
            Ok("link".to_string())
        })
        .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(captured, "line1\nline2\n");
    }

    #[test]
    fn blank_line_mid_body_terminates_the_body_scan() {
        let src = "fun a():\n    line1\n\n    line2\nfun b():\n    ok\n";
        let mut captured = Vec::new();
        let tasks = parse(src, |_id, code| {
            captured.push(code.to_string());
            Ok("link".to_string())
        })
        .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(captured[0], "line1\n");
    }
}
