//! Per-kind message templates.
//!
//! Externalized as data (one `Template` per `EventKind`) rather than
//! scattered `format!` calls, so a message-style change is a data edit, not
//! a worker re-release (spec.md §9's open question). Every template is
//! total over its declared fields: any field absent from the payload
//! renders as `"N/A"`.

use super::EventKind;
use serde_json::Value;

pub struct Template {
    pub emoji: &'static str,
    pub title: &'static str,
    pub fields: &'static [&'static str],
}

fn field(payload: &Value, key: &str) -> String {
    match payload.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Null) | None => "N/A".to_string(),
        Some(other) => other.to_string(),
    }
}

pub fn template_for(kind: EventKind) -> Template {
    match kind {
        EventKind::News => Template {
            emoji: "📰",
            title: "News Alert",
            fields: &["title", "impact_score", "reasoning", "url"],
        },
        EventKind::Disclosure => Template {
            emoji: "📄",
            title: "Disclosure Alert",
            fields: &["report_name", "sentiment_label", "expected_impact_direction", "horizon_tag", "summary"],
        },
        EventKind::Chart => Template {
            emoji: "📈",
            title: "Chart Condition",
            fields: &["condition", "close_price", "volume", "past_case_return"],
        },
        EventKind::Flow => Template {
            emoji: "💰",
            title: "Flow Signal",
            fields: &["daily_inst_strong", "rt_prog_strong", "prog_ratio"],
        },
        EventKind::Report => Template {
            emoji: "🗂️",
            title: "Weekly Report",
            fields: &["summary"],
        },
        EventKind::System => Template {
            emoji: "⚙️",
            title: "System Notice",
            fields: &["message"],
        },
        EventKind::Error => Template {
            emoji: "🛑",
            title: "Error",
            fields: &["message", "service"],
        },
    }
}

/// Render `kind`'s template over `stock_name`/`stock_code`/`payload`,
/// producing the HTML body the Telegram transport sends (parse_mode HTML).
pub fn render(kind: EventKind, stock_name: &str, stock_code: &str, payload: &Value, timestamp: &str) -> String {
    let tpl = template_for(kind);
    let mut body = format!("{} <b>{}</b>\n{} ({})\n", tpl.emoji, tpl.title, stock_name, stock_code);
    for f in tpl.fields {
        body.push_str(&format!("{}: {}\n", f, field(payload, f)));
    }
    body.push_str(timestamp);
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_field_renders_na() {
        let out = render(EventKind::News, "삼성전자", "005930", &json!({"title": "headline"}), "2026-01-01T00:00:00Z");
        assert!(out.contains("impact_score: N/A"));
        assert!(out.contains("title: headline"));
    }

    #[test]
    fn every_kind_has_a_template() {
        for kind in [
            EventKind::News,
            EventKind::Disclosure,
            EventKind::Chart,
            EventKind::Flow,
            EventKind::Report,
            EventKind::System,
            EventKind::Error,
        ] {
            let tpl = template_for(kind);
            assert!(!tpl.fields.is_empty());
        }
    }
}
