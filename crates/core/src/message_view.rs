//! Presentation model for a single stored message.
//!
//! The same service contract backs two bindings: `Compact` shows a run button
//! and a cycling limit button next to the SQL, `Table` runs on send and lets
//! the results table pick a larger limit when output looks truncated.

use serde::{Deserialize, Serialize};

use crate::limits;
use crate::message::{Message, Role};
use crate::results_table::ResultsTable;

pub const DEFAULT_DIALECT: &str = "postgresql";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PresentationVariant {
    Compact,
    #[default]
    Table,
}

impl PresentationVariant {
    /// Whether a fresh prompt should also execute the generated SQL.
    #[must_use]
    pub fn runs_on_send(self) -> bool {
        matches!(self, Self::Table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageAction {
    CopySql,
    Run,
    CycleLimit,
    ExportCsv,
    ExportJson,
    FullScreen,
    ChangeLimit,
}

impl MessageAction {
    #[must_use]
    pub fn title(self) -> &'static str {
        match self {
            Self::CopySql => "Copy",
            Self::Run => "Run",
            Self::CycleLimit => "Limit",
            Self::ExportCsv => "Export CSV",
            Self::ExportJson => "Export JSON",
            Self::FullScreen => "Full screen",
            Self::ChangeLimit => "More rows",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlBlock<'a> {
    pub sql: &'a str,
    pub dialect: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageView<'a> {
    pub id: &'a str,
    pub role: Role,
    pub content: &'a str,
    pub sql: Option<SqlBlock<'a>>,
    pub results: Option<ResultsTable<'a>>,
    pub query_error: Option<&'a str>,
    pub actions: Vec<MessageAction>,
    pub running: bool,
    pub limit_label: Option<String>,
}

impl<'a> MessageView<'a> {
    /// `current_limit` is the store's limit preference; `running` is whether a
    /// run for this message is in flight.
    #[must_use]
    pub fn from_message(
        message: &'a Message,
        current_limit: u32,
        variant: PresentationVariant,
        running: bool,
    ) -> Self {
        let sql = message.display_sql().map(|sql| SqlBlock {
            sql,
            dialect: message
                .database_type
                .as_deref()
                .map(normalize_dialect)
                .unwrap_or(DEFAULT_DIALECT),
        });

        let results_limit = message.results_limit.unwrap_or(current_limit);
        let results = message
            .results
            .as_deref()
            .map(|rows| ResultsTable::new(rows, Some(results_limit)));

        let mut actions = Vec::new();
        if sql.is_some() && message.role == Role::Assistant {
            actions.push(MessageAction::CopySql);
            if !running {
                actions.push(MessageAction::Run);
            }
            if variant == PresentationVariant::Compact {
                actions.push(MessageAction::CycleLimit);
            }
        }
        if let Some(table) = &results {
            if !table.is_empty() {
                actions.push(MessageAction::ExportCsv);
                actions.push(MessageAction::ExportJson);
                actions.push(MessageAction::FullScreen);
            }
            if table.is_truncated() && !running && variant == PresentationVariant::Table {
                actions.push(MessageAction::ChangeLimit);
            }
        }

        let limit_label = (sql.is_some() && variant == PresentationVariant::Compact)
            .then(|| limits::limit_label(current_limit));

        Self {
            id: &message.id,
            role: message.role,
            content: &message.content,
            sql,
            results,
            query_error: message.run_error.as_deref(),
            actions,
            running,
            limit_label,
        }
    }

    #[must_use]
    pub fn has_action(&self, action: MessageAction) -> bool {
        self.actions.contains(&action)
    }

    /// Heading shown above a result block.
    #[must_use]
    pub fn results_heading(&self) -> Option<String> {
        let table = self.results.as_ref()?;
        Some(if table.is_empty() {
            "Query executed".to_string()
        } else {
            format!("Query results ({})", table.row_count_label())
        })
    }
}

fn normalize_dialect(dialect: &str) -> &str {
    if dialect == "postgres" {
        DEFAULT_DIALECT
    } else {
        dialect
    }
}
