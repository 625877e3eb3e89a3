use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding this crate's own Rust sources.
const SOURCE_ROOTS: [&str; 4] = ["analysis", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED", "CORRECTED", "FIX", "FIXES", "NEW", "CHANGED", "CHANGES", "CHANGE", "MODIFIED",
    "MODIFIES", "MODIFY", "UPDATED", "UPDATES", "UPDATE",
];

#[derive(Clone, Copy)]
enum Rule {
    UnderscorePrefix,
    ForbiddenWords,
    StarsInComment,
    UppercaseComment,
    AllowDeadCode,
}

impl Rule {
    fn pattern(self) -> String {
        match self {
            Rule::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            Rule::ForbiddenWords => format!(r"(//|/\*).*(?:{})", FORBIDDEN_WORDS.join("|")),
            Rule::StarsInComment => r"(//|/\*).*\*\*".to_string(),
            Rule::UppercaseComment => r"(//|/\*).*".to_string(),
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    fn applies_to_build_script(self) -> bool {
        matches!(self, Rule::UnderscorePrefix)
    }

    fn explanation(self) -> String {
        match self {
            Rule::UnderscorePrefix => "Underscore-prefixed names are not allowed in this project.\n   \
                 Either use the variable (removing the underscore) or remove it completely."
                .to_string(),
            Rule::ForbiddenWords => format!(
                "Comments containing {} are not allowed in this project.\n   \
                 Remove them completely rather than commenting them out.",
                FORBIDDEN_WORDS.map(|w| format!("'{w}'")).join(", ")
            ),
            Rule::StarsInComment => {
                "The '**' pattern is not allowed in regular comments (doc comments may use it)."
                    .to_string()
            }
            Rule::UppercaseComment => {
                "Comments where all alphabetic characters are uppercase are not allowed.".to_string()
            }
            Rule::AllowDeadCode => "#[allow(dead_code)] attributes are not allowed in this project.\n   \
                 Either use the code (removing the attribute) or remove it completely."
                .to_string(),
        }
    }

    /// Decides whether a line the regex matched is a real violation.
    fn is_violation(self, line: &str) -> bool {
        let trimmed = line.trim_start();
        match self {
            Rule::UnderscorePrefix => !is_comment(line) && !underscore_only_in_strings(line),
            Rule::ForbiddenWords | Rule::AllowDeadCode => true,
            Rule::StarsInComment => !trimmed.starts_with("///") && !trimmed.starts_with("//!"),
            Rule::UppercaseComment => comment_text(line).is_some_and(|text| {
                let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(char::is_uppercase)
            }),
        }
    }
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with("//")
        || (line.contains("/*") && !line.contains("*/match") && !line.contains("*/let"))
}

// Any quoted segment holding an underscore counts as a string match.
fn underscore_only_in_strings(line: &str) -> bool {
    line.contains('"')
        && line
            .split('"')
            .enumerate()
            .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///").or_else(|| trimmed.strip_prefix("//!")) {
        return Some(rest.trim());
    }
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Some(rest.trim());
    }
    let start = line.find("/*")? + 2;
    let body = &line[start..];
    Some(body.find("*/").map_or(body, |end| &body[..end]).trim())
}

// Collects every violating line of one file for one rule.
struct ViolationCollector {
    rule: Rule,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl ViolationCollector {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} source policy violations in {}:\n",
            self.violations.len(),
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.rule.explanation()));
        Some(error_msg)
    }
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.rule.is_violation(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_ROOTS
        .into_iter()
        .filter(|root| Path::new(root).is_dir())
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
}

fn scan(rule: Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern())?;
    let mut searcher = Searcher::new();

    let build_script = rule
        .applies_to_build_script()
        .then(|| PathBuf::from("build.rs"));
    for path in rust_sources().chain(build_script) {
        let mut collector = ViolationCollector::new(rule, &path);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    let rules = [
        Rule::UnderscorePrefix,
        Rule::ForbiddenWords,
        Rule::StarsInComment,
        Rule::UppercaseComment,
        Rule::AllowDeadCode,
    ];
    for rule in rules {
        if let Err(e) = scan(rule) {
            // Printed to stderr so cargo shows it with the failed build.
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
