//! Rendering of Linear events into prompts for the agent.
//!
//! Missing or `null` fields fall back to placeholder text; formatting never
//! fails.

use serde_json::{Map, Value};

use crate::webhooks::{EventKind, WebhookPayload};

type Data = Map<String, Value>;

/// Format a delivery into the message sent to the agent.
#[must_use]
pub fn format_payload(payload: &WebhookPayload) -> String {
    format_linear_event(&payload.event_type, &payload.action, &payload.data)
}

/// Format Linear event data into a readable message.
#[must_use]
pub fn format_linear_event(event_type: &str, action: &str, data: &Data) -> String {
    let verb = action_verb(action);
    match EventKind::from_type(event_type) {
        EventKind::Issue => format_issue(verb, data),
        EventKind::Comment => format_comment(verb, data),
        EventKind::Project => format_project(verb, data),
        EventKind::Cycle => format_cycle(verb, data),
        EventKind::Label => format_label(verb, data),
        EventKind::Other(kind) => format_generic(&kind, data),
    }
}

fn action_verb(action: &str) -> &'static str {
    match action {
        "create" => "Created",
        "update" => "Updated",
        "remove" => "Removed",
        _ => "Event",
    }
}

fn format_issue(verb: &str, data: &Data) -> String {
    let title = text(data, "title").unwrap_or_else(|| "Untitled".to_string());
    let heading = match text(data, "identifier") {
        Some(identifier) => format!("{identifier} - {title}"),
        None => title,
    };
    let team = nested_name(data, "team").unwrap_or_else(|| "Unknown team".to_string());
    let state = nested_name(data, "state").unwrap_or_else(|| "Unknown".to_string());
    let priority = priority(data).unwrap_or_else(|| "None".to_string());
    let assignee = nested_name(data, "assignee").unwrap_or_else(|| "Unassigned".to_string());
    let description = text(data, "description").unwrap_or_else(|| "No description".to_string());
    let url = text(data, "url").unwrap_or_default();

    let labels = data
        .get("labels")
        .and_then(Value::as_array)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|l| l.get("name").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .filter(|joined| !joined.is_empty())
        .map(|joined| format!("**Labels:** {joined}\n"))
        .unwrap_or_default();

    format!(
        "📋 Linear Issue {verb}

**Issue:** {heading}
**Team:** {team}
**Status:** {state}
**Priority:** {priority}
**Assignee:** {assignee}
{labels}
**Description:**
{description}

**Link:** {url}
"
    )
}

fn format_comment(verb: &str, data: &Data) -> String {
    let body = text(data, "body").unwrap_or_else(|| "No content".to_string());
    let author = nested_name(data, "user").unwrap_or_else(|| "Unknown user".to_string());
    let issue = data.get("issue").and_then(Value::as_object);
    let issue_title = issue
        .and_then(|i| text(i, "title"))
        .unwrap_or_else(|| "Unknown issue".to_string());
    let issue_heading = match issue.and_then(|i| text(i, "identifier")) {
        Some(identifier) => format!("{identifier} - {issue_title}"),
        None => issue_title,
    };
    let url = text(data, "url").unwrap_or_default();

    let headline = if verb == "Created" {
        "💬 New Comment on Linear Issue".to_string()
    } else {
        format!("💬 Linear Comment {verb}")
    };

    format!(
        "{headline}

**Issue:** {issue_heading}
**Author:** {author}

**Comment:**
{body}

**Link:** {url}
"
    )
}

fn format_project(verb: &str, data: &Data) -> String {
    let name = text(data, "name").unwrap_or_else(|| "Untitled project".to_string());
    let description = text(data, "description").unwrap_or_else(|| "No description".to_string());
    let state = text(data, "state")
        .or_else(|| nested_name(data, "status"))
        .unwrap_or_else(|| "Unknown".to_string());
    let lead = nested_name(data, "lead").unwrap_or_else(|| "No lead".to_string());
    let url = text(data, "url").unwrap_or_default();

    format!(
        "🎯 Linear Project {verb}

**Project:** {name}
**Lead:** {lead}
**State:** {state}

**Description:**
{description}

**Link:** {url}
"
    )
}

fn format_cycle(verb: &str, data: &Data) -> String {
    let name = text(data, "name").unwrap_or_else(|| "Unnamed cycle".to_string());
    let heading = match text(data, "number") {
        Some(number) => format!("Cycle {number} - {name}"),
        None => name,
    };
    let team = nested_name(data, "team").unwrap_or_else(|| "Unknown team".to_string());
    let starts = text(data, "startsAt").unwrap_or_else(|| "Unknown".to_string());
    let ends = text(data, "endsAt").unwrap_or_else(|| "Unknown".to_string());
    let progress = data
        .get("progress")
        .and_then(Value::as_f64)
        .map_or_else(|| "Unknown".to_string(), |p| format!("{:.0}%", p * 100.0));

    format!(
        "🔄 Linear Cycle {verb}

**Cycle:** {heading}
**Team:** {team}
**Starts:** {starts}
**Ends:** {ends}
**Progress:** {progress}
"
    )
}

fn format_label(verb: &str, data: &Data) -> String {
    let name = text(data, "name").unwrap_or_else(|| "Unnamed label".to_string());
    let color = text(data, "color").unwrap_or_else(|| "None".to_string());
    let team = nested_name(data, "team").unwrap_or_else(|| "Workspace".to_string());
    let description = text(data, "description").unwrap_or_else(|| "No description".to_string());

    format!(
        "🏷️ Linear Label {verb}

**Label:** {name}
**Color:** {color}
**Team:** {team}

**Description:**
{description}
"
    )
}

fn format_generic(event_type: &str, data: &Data) -> String {
    let id = text(data, "id").unwrap_or_else(|| "unknown".to_string());
    let rendered = serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string());

    format!("New {event_type} event (ID: {id})\n\nEvent data: {rendered}")
}

/// Scalar field as display text. Strings are taken verbatim, numbers and
/// booleans are rendered, anything else counts as missing.
fn text(data: &Data, key: &str) -> Option<String> {
    match data.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// `data[key].name`, tolerating a missing or `null` parent.
fn nested_name(data: &Data, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_object)
        .and_then(|inner| text(inner, "name"))
}

/// Priority as sent, with Linear's label appended for the known levels.
fn priority(data: &Data) -> Option<String> {
    let raw = text(data, "priority")?;
    let label = data
        .get("priorityLabel")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| {
            let level = data.get("priority").and_then(Value::as_u64)?;
            let name = match level {
                0 => "No priority",
                1 => "Urgent",
                2 => "High",
                3 => "Medium",
                4 => "Low",
                _ => return None,
            };
            Some(name.to_string())
        });

    Some(match label {
        Some(label) if label != raw => format!("{raw} ({label})"),
        _ => raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> Data {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_issue_contains_key_fields_verbatim() {
        let data = data(json!({
            "id": "issue-1",
            "identifier": "ENG-42",
            "title": "Fix login redirect",
            "state": {"name": "In Progress"},
            "priority": 2,
            "assignee": {"name": "Grace Hopper"},
            "team": {"name": "Engineering"},
            "description": "Users bounce back to /login.",
            "url": "https://linear.app/acme/issue/ENG-42",
            "labels": [{"name": "bug"}, {"name": "auth"}]
        }));

        let message = format_linear_event("Issue", "update", &data);

        assert!(message.starts_with("📋 Linear Issue Updated"));
        assert!(message.contains("Fix login redirect"));
        assert!(message.contains("In Progress"));
        assert!(message.contains("**Priority:** 2 (High)"));
        assert!(message.contains("Grace Hopper"));
        assert!(message.contains("**Issue:** ENG-42 - Fix login redirect"));
        assert!(message.contains("**Team:** Engineering"));
        assert!(message.contains("**Labels:** bug, auth"));
        assert!(message.contains("**Link:** https://linear.app/acme/issue/ENG-42"));
    }

    #[test]
    fn test_issue_placeholders_for_missing_and_null_fields() {
        let data = data(json!({
            "id": "issue-2",
            "assignee": null,
            "state": null
        }));

        let message = format_linear_event("Issue", "create", &data);

        assert!(message.starts_with("📋 Linear Issue Created"));
        assert!(message.contains("**Issue:** Untitled"));
        assert!(message.contains("**Status:** Unknown"));
        assert!(message.contains("**Priority:** None"));
        assert!(message.contains("**Assignee:** Unassigned"));
        assert!(message.contains("**Team:** Unknown team"));
        assert!(message.contains("No description"));
        assert!(!message.contains("**Labels:**"));
    }

    #[test]
    fn test_string_priority_kept_verbatim() {
        let data = data(json!({"title": "t", "priority": "P1"}));
        let message = format_linear_event("Issue", "update", &data);
        assert!(message.contains("**Priority:** P1\n"));
    }

    #[test]
    fn test_comment() {
        let data = data(json!({
            "body": "Can we ship this today?",
            "user": {"name": "Linus"},
            "issue": {"identifier": "ENG-7", "title": "Release"},
            "url": "https://linear.app/acme/comment/1"
        }));

        let message = format_linear_event("Comment", "create", &data);

        assert!(message.starts_with("💬 New Comment on Linear Issue"));
        assert!(message.contains("**Issue:** ENG-7 - Release"));
        assert!(message.contains("**Author:** Linus"));
        assert!(message.contains("Can we ship this today?"));
    }

    #[test]
    fn test_comment_without_issue() {
        let message = format_linear_event("Comment", "remove", &Data::new());

        assert!(message.starts_with("💬 Linear Comment Removed"));
        assert!(message.contains("Unknown issue"));
        assert!(message.contains("Unknown user"));
        assert!(message.contains("No content"));
    }

    #[test]
    fn test_project() {
        let data = data(json!({
            "name": "Q3 Platform",
            "state": "started",
            "lead": {"name": "Barbara"},
            "description": "Platform work"
        }));

        let message = format_linear_event("Project", "update", &data);

        assert!(message.contains("🎯 Linear Project Updated"));
        assert!(message.contains("**Project:** Q3 Platform"));
        assert!(message.contains("**Lead:** Barbara"));
        assert!(message.contains("**State:** started"));
    }

    #[test]
    fn test_cycle() {
        let data = data(json!({
            "number": 12,
            "name": "Sprint 12",
            "team": {"name": "Core"},
            "startsAt": "2024-05-01T00:00:00.000Z",
            "endsAt": "2024-05-15T00:00:00.000Z",
            "progress": 0.45
        }));

        let message = format_linear_event("Cycle", "update", &data);

        assert!(message.contains("**Cycle:** Cycle 12 - Sprint 12"));
        assert!(message.contains("**Team:** Core"));
        assert!(message.contains("**Progress:** 45%"));
        assert!(message.contains("2024-05-15T00:00:00.000Z"));
    }

    #[test]
    fn test_label_accepts_issue_label_type() {
        let data = data(json!({"name": "regression", "color": "#ff0000"}));

        let message = format_linear_event("IssueLabel", "create", &data);

        assert!(message.contains("🏷️ Linear Label Created"));
        assert!(message.contains("**Label:** regression"));
        assert!(message.contains("**Color:** #ff0000"));
        assert!(message.contains("**Team:** Workspace"));
    }

    #[test]
    fn test_unknown_type_is_generic() {
        let data = data(json!({"id": "rx-1", "emoji": "tada"}));

        let message = format_linear_event("Reaction", "create", &data);

        assert!(message.starts_with("New Reaction event (ID: rx-1)"));
        assert!(message.contains("\"emoji\": \"tada\""));
    }
}
