use crate::types::Set;
use std::fmt::Write;

pub const TITLE: &str = "Link Availability Report";

/// A rendered plain-text report for one or more stored sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub numbers: Vec<u64>,
    pub body: String,
}

impl Report {
    pub fn render(sets: &[Set]) -> Self {
        let mut body = String::new();
        let _ = writeln!(body, "{}", TITLE);

        for set in sets {
            let _ = writeln!(body);
            let _ = writeln!(body, "Set #{}", set.number);
            for (i, link) in set.links.iter().enumerate() {
                let _ = writeln!(body, "{}. {:<42} - {}", i + 1, link.domain, link.label());
            }
        }

        Self {
            numbers: sets.iter().map(|s| s.number).collect(),
            body,
        }
    }

    /// `set_3.txt` for one set, `sets_1-4-9.txt` for several.
    pub fn file_name(&self) -> String {
        match self.numbers.as_slice() {
            [] => "report.txt".to_string(),
            [one] => format!("set_{}.txt", one),
            many => {
                let joined: Vec<String> = many.iter().map(|n| n.to_string()).collect();
                format!("sets_{}.txt", joined.join("-"))
            }
        }
    }
}
