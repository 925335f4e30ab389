/// Per-table tuning knobs.
///
/// ```rust
/// use hourglass_cache::TableConfig;
///
/// let config = TableConfig::new()
///     .parallel_scan_threshold(10_000)
///     .thread_name_prefix("sessions");
/// assert_eq!(config.get_parallel_scan_threshold(), 10_000);
/// ```
#[derive(Clone, Debug)]
pub struct TableConfig {
    parallel_scan_threshold: usize,
    thread_name_prefix: String,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            parallel_scan_threshold: 4096,
            thread_name_prefix: String::from("hourglass-sweeper"),
        }
    }
}

impl TableConfig {
    pub fn new() -> Self {
        Self::default()
    }
    /// Entry count from which a sweep scans the table on the rayon pool
    /// instead of sequentially.
    pub fn get_parallel_scan_threshold(&self) -> usize {
        self.parallel_scan_threshold
    }
    pub fn get_thread_name_prefix(&self) -> &str {
        &self.thread_name_prefix
    }
    pub fn parallel_scan_threshold(mut self, threshold: usize) -> Self {
        self.parallel_scan_threshold = threshold;
        self
    }
    /// The sweeper thread of a table is named `"{prefix}-{table name}"`.
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}
