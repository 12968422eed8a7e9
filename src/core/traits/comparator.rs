/// Output equivalence policy used by the judge.
pub trait Comparator: std::fmt::Debug + Send + Sync {
    fn matches(&self, expected: &str, actual: &str) -> bool;

    /// Lines as this comparator sees them, used to render diff excerpts.
    fn normalized_lines<'a>(&self, text: &'a str) -> Vec<&'a str> {
        text.lines().collect()
    }
}
