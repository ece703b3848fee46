//! A plain default [`ContentRenderer`].
//!
//! Applications with their own templates implement [`ContentRenderer`] themselves; this one only
//! lists the counts from the [`RoleSummary`].
use std::fmt::Write;

use async_trait::async_trait;
use remindr::{
    collaborator::{CollaboratorError, ContentRenderer, RenderedEmail, TaskSummary, User},
    job::JobKind,
    summary::RoleSummary,
};

#[derive(Debug, Clone)]
pub struct HtmlRenderer {
    product_name: String,
}

impl Default for HtmlRenderer {
    fn default() -> Self {
        Self::new("Remindr")
    }
}

impl HtmlRenderer {
    pub fn new(product_name: impl Into<String>) -> Self {
        Self {
            product_name: product_name.into(),
        }
    }

    fn subject(&self, kind: JobKind, summary: &RoleSummary) -> String {
        let pending = summary.pending_count();
        match kind {
            JobKind::DailyDigest => format!("{}: your daily task summary", self.product_name),
            JobKind::DayEndReminder => format!(
                "{}: {pending} task{} still open today",
                self.product_name,
                if pending == 1 { "" } else { "s" }
            ),
        }
    }
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn section(html: &mut String, title: &str, summary: &TaskSummary) {
    // Writing to a String cannot fail.
    let _ = write!(
        html,
        "<h3>{title}</h3><ul>\
         <li>Open: {}</li><li>Overdue: {}</li><li>Due today: {}</li>\
         </ul>",
        summary.total_count, summary.overdue_count, summary.due_today_count
    );
}

#[async_trait]
impl ContentRenderer for HtmlRenderer {
    async fn render(
        &self,
        kind: JobKind,
        user: &User,
        summary: &RoleSummary,
    ) -> Result<RenderedEmail, CollaboratorError> {
        let mut html = format!("<p>Hello {},</p>", escape(&user.name));
        match summary {
            RoleSummary::Manager { created, firm } => {
                section(&mut html, "Tasks you created", created);
                section(&mut html, "Firm backlog", firm);
            }
            RoleSummary::Staff { summary } => section(&mut html, "Your tasks", summary),
        }
        html.push_str(&format!("<p>{}</p>", escape(&self.product_name)));

        Ok(RenderedEmail {
            subject: self.subject(kind, summary),
            html,
        })
    }
}
