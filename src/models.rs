use chrono::NaiveDate;

/// Side-neutral view of one task, rebuilt from a live source on every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub title: String,
    pub due_date: Option<NaiveDate>,
    pub completed: bool,
    pub canceled: bool,
    pub note: String,
    /// Identifier that is only meaningful on the side the record came from.
    pub source_id: String,
    /// Display-only enrichment; never part of a fingerprint.
    pub customer: Option<String>,
    /// Remote id referenced by an embedded cross-reference URL.
    pub link: Option<String>,
    /// Carries the creation tag, i.e. asks to be mirrored to the remote side.
    pub tagged: bool,
}

impl TaskRecord {
    pub fn is_terminal(&self) -> bool {
        self.completed || self.canceled
    }

    pub fn status_class(&self) -> &'static str {
        if self.canceled {
            "canceled"
        } else if self.completed {
            "done"
        } else {
            "open"
        }
    }
}

#[cfg(test)]
pub(crate) fn record(source_id: &str, title: &str) -> TaskRecord {
    TaskRecord {
        title: title.to_string(),
        due_date: None,
        completed: false,
        canceled: false,
        note: String::new(),
        source_id: source_id.to_string(),
        customer: None,
        link: None,
        tagged: false,
    }
}
