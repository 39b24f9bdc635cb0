use serde_json::Value;
use spotmail_proto::{Payload, TemplateName};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("template `{template}` requires payload key `{key}`")]
    MissingKey { template: TemplateName, key: &'static str },
}

struct TemplateSource {
    subject: &'static str,
    html: &'static str,
    text: &'static str,
    required: &'static [&'static str],
}

fn source(name: TemplateName) -> TemplateSource {
    match name {
        TemplateName::Welcome => TemplateSource {
            subject: "Welcome to SpotItForMe, {{name}}!",
            html: concat!(
                "<h1>Welcome, {{name}}!</h1>",
                "<p>Post a spot for anything you are looking for and the community will keep an eye out.</p>",
                "<p><a href=\"{{appUrl}}\">Open SpotItForMe</a></p>",
            ),
            text: concat!(
                "Welcome, {{name}}!\n\n",
                "Post a spot for anything you are looking for and the community will keep an eye out.\n",
                "{{appUrl}}\n",
            ),
            required: &["name"],
        },
        TemplateName::SpotCreated => TemplateSource {
            subject: "Your spot \"{{spotTitle}}\" is live",
            html: concat!(
                "<h1>Your spot is live</h1>",
                "<p>Hi {{name}}, we are now searching for <strong>{{spotTitle}}</strong>.</p>",
                "<p><a href=\"{{spotUrl}}\">View your spot</a></p>",
            ),
            text: concat!(
                "Hi {{name}}, we are now searching for {{spotTitle}}.\n",
                "{{spotUrl}}\n",
            ),
            required: &["spotTitle"],
        },
        TemplateName::SightingReported => TemplateSource {
            subject: "New sighting for \"{{spotTitle}}\"",
            html: concat!(
                "<h1>Someone spotted it</h1>",
                "<p>{{reporterName}} reported a sighting of <strong>{{spotTitle}}</strong> near {{location}}.</p>",
                "<p>{{note}}</p>",
                "<p><a href=\"{{spotUrl}}\">Review the sighting</a></p>",
            ),
            text: concat!(
                "{{reporterName}} reported a sighting of {{spotTitle}} near {{location}}.\n",
                "{{note}}\n",
                "{{spotUrl}}\n",
            ),
            required: &["spotTitle", "location"],
        },
        TemplateName::SpotFound => TemplateSource {
            subject: "Good news: \"{{spotTitle}}\" was found",
            html: concat!(
                "<h1>Found!</h1>",
                "<p>Hi {{name}}, <strong>{{spotTitle}}</strong> has been marked as found.</p>",
                "<p><a href=\"{{spotUrl}}\">See the details</a></p>",
            ),
            text: concat!(
                "Hi {{name}}, {{spotTitle}} has been marked as found.\n",
                "{{spotUrl}}\n",
            ),
            required: &["spotTitle"],
        },
        TemplateName::PasswordReset => TemplateSource {
            subject: "Reset your SpotItForMe password",
            html: concat!(
                "<p>Someone asked to reset the password for this account.</p>",
                "<p><a href=\"{{resetUrl}}\">Choose a new password</a></p>",
                "<p>If it was not you, ignore this email.</p>",
            ),
            text: concat!(
                "Someone asked to reset the password for this account.\n",
                "Choose a new password: {{resetUrl}}\n",
                "If it was not you, ignore this email.\n",
            ),
            required: &["resetUrl"],
        },
        TemplateName::Contact => TemplateSource {
            subject: "Contact form: {{topic}}",
            html: concat!(
                "<p><strong>{{name}}</strong> ({{email}}) wrote:</p>",
                "<blockquote>{{message}}</blockquote>",
            ),
            text: "{{name}} ({{email}}) wrote:\n\n{{message}}\n",
            required: &["name", "email", "message"],
        },
        TemplateName::AdminAlert => TemplateSource {
            subject: "[SpotItForMe] {{context}} failed",
            html: concat!(
                "<h1>Email processing failure</h1>",
                "<p><strong>Context:</strong> {{context}}</p>",
                "<p><strong>Error:</strong> {{error}}</p>",
                "<p><strong>Time:</strong> {{timestamp}}</p>",
            ),
            text: concat!(
                "Email processing failure\n\n",
                "Context: {{context}}\n",
                "Error: {{error}}\n",
                "Time: {{timestamp}}\n",
            ),
            required: &["context", "error", "timestamp"],
        },
    }
}

/// Renders `name` against `payload`.
///
/// Required keys must be present and non-null; optional placeholders with no
/// value render empty. Values are HTML-escaped in the HTML body only, and
/// line breaks are flattened in the subject.
pub fn render(
    name: TemplateName,
    payload: &Payload,
) -> Result<RenderedEmail, RenderError> {
    let source = source(name);

    for &key in source.required {
        if payload.get(key).is_none_or(Value::is_null) {
            return Err(RenderError::MissingKey { template: name, key });
        }
    }

    let subject = substitute(source.subject, payload, Escape::None)
        .replace(['\r', '\n'], " ");

    Ok(RenderedEmail {
        subject,
        html: substitute(source.html, payload, Escape::Html),
        text: substitute(source.text, payload, Escape::None),
    })
}

#[derive(Clone, Copy)]
enum Escape {
    None,
    Html,
}

fn substitute(
    template: &str,
    payload: &Payload,
    escape: Escape,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let value =
            payload.get(after[..end].trim()).map(value_text).unwrap_or_default();
        match escape {
            Escape::None => out.push_str(&value),
            Escape::Html => out.push_str(&escape_html(&value)),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
