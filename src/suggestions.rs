/// Canned questions offered in the "Quick Questions" menu.
pub const SUGGESTIONS: [&str; 3] = [
    "How do I recycle plastics?",
    "How to dispose of electronic waste?",
    "How can I reduce food waste at home?",
];

pub fn suggestion(index: usize) -> Option<&'static str> {
    SUGGESTIONS.get(index).copied()
}
