/// Failures that reject a whole feed. Row-level problems are skipped and
/// logged instead and never surface here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// Tabular header lacks required columns.
    MissingColumns { feed: String, columns: Vec<String> },
    /// Neither a known spreadsheet layout nor a calendar.
    UnknownFormat(String),
    /// A tabular row names a property we cannot resolve.
    UnresolvedProperty { feed: String, row: usize, name: String },
    Csv { feed: String, message: String },
    TooLarge { feed: String, bytes: usize },
    Malformed { feed: String, message: String },
    /// The source artifact could not be read at all.
    Unreadable { feed: String, message: String },
}

impl FeedError {
    pub fn feed(&self) -> &str {
        match self {
            FeedError::MissingColumns { feed, .. }
            | FeedError::UnresolvedProperty { feed, .. }
            | FeedError::Csv { feed, .. }
            | FeedError::TooLarge { feed, .. }
            | FeedError::Malformed { feed, .. }
            | FeedError::Unreadable { feed, .. } => feed,
            FeedError::UnknownFormat(feed) => feed,
        }
    }
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedError::MissingColumns { feed, columns } => {
                write!(f, "feed '{feed}': missing column(s) {}", columns.join(", "))
            }
            FeedError::UnknownFormat(feed) => write!(f, "feed '{feed}': unrecognized format"),
            FeedError::UnresolvedProperty { feed, row, name } => {
                write!(f, "feed '{feed}', row {row}: unknown property '{name}'")
            }
            FeedError::Csv { feed, message } => write!(f, "feed '{feed}': CSV error: {message}"),
            FeedError::TooLarge { feed, bytes } => {
                write!(f, "feed '{feed}': {bytes} bytes exceeds the feed size limit")
            }
            FeedError::Malformed { feed, message } => write!(f, "feed '{feed}': {message}"),
            FeedError::Unreadable { feed, message } => {
                write!(f, "feed '{feed}': cannot read source: {message}")
            }
        }
    }
}

impl std::error::Error for FeedError {}
