//! # Change Validation
//!
//! ## Responsibility
//! Decide whether a generated change is deployable. Four checks run on every
//! file: lexical well-formedness, import resolution against the known
//! codebase graph, a regex security deny-list, and a quality score.
//!
//! ## Guarantees
//! - Every check runs; all failures are reported, not just the first
//! - A [`ValidatedChange`] can only be produced by [`ChangeValidator`], so an
//!   unvalidated or rejected change cannot reach deployment
//! - Quality = 0.6 × complexity + 0.4 × style, in `[0, 1]`
//!
//! ## NOT Responsible For
//! - Compiling or executing generated code
//! - Retrying rejected changes

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ValidationConfig;
use crate::metrics;

// ─── Types ──────────────────────────────────────────────────────────────────

/// Raw output of the generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedChange {
    /// Unique id.
    pub id: Uuid,
    /// Opportunity the change addresses; `None` for ad hoc requests.
    pub opportunity_id: Option<Uuid>,
    /// Path to full file content.
    pub files: BTreeMap<String, String>,
    /// Model that produced the change.
    pub model_used: String,
    /// Tokens consumed.
    pub token_count: u64,
    /// When the change was received.
    pub created_at: DateTime<Utc>,
}

/// Results of the validation checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Every file is lexically well formed.
    pub syntax_ok: bool,
    /// Every import resolves.
    pub imports_ok: bool,
    /// No deny-list pattern matched.
    pub security_ok: bool,
    /// Quality score in `[0, 1]`.
    pub quality_score: f64,
}

/// Why a change was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    /// The change contains no files.
    EmptyChange,
    /// A file is not well formed.
    Syntax {
        /// Offending file.
        file: String,
        /// What is wrong.
        detail: String,
    },
    /// An import does not resolve.
    UnresolvedImport {
        /// Offending file.
        file: String,
        /// The import path.
        import: String,
    },
    /// A deny-list pattern matched.
    SecurityViolation {
        /// Offending file.
        file: String,
        /// The matching pattern.
        pattern: String,
    },
    /// Quality score below threshold.
    QualityBelowThreshold {
        /// Score reached.
        score: f64,
        /// Required score.
        threshold: f64,
    },
}

impl RejectionReason {
    /// Stable label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::EmptyChange => "empty_change",
            Self::Syntax { .. } => "syntax",
            Self::UnresolvedImport { .. } => "unresolved_import",
            Self::SecurityViolation { .. } => "security_violation",
            Self::QualityBelowThreshold { .. } => "quality_below_threshold",
        }
    }
}

/// A change that failed validation. It is discarded, never deployed.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("change {change_id} rejected: {}", summarize(.reasons))]
pub struct ValidationRejection {
    /// Rejected change.
    pub change_id: Uuid,
    /// Opportunity it belonged to.
    pub opportunity_id: Option<Uuid>,
    /// Check results.
    pub report: ValidationReport,
    /// Every failure found.
    pub reasons: Vec<RejectionReason>,
}

fn summarize(reasons: &[RejectionReason]) -> String {
    reasons
        .iter()
        .map(RejectionReason::label)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join(", ")
}

/// A change that passed every check.
///
/// Only [`ChangeValidator::validate`] constructs this type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedChange {
    change: GeneratedChange,
    report: ValidationReport,
}

impl ValidatedChange {
    /// The validated change.
    pub fn change(&self) -> &GeneratedChange {
        &self.change
    }

    /// Check results.
    pub fn report(&self) -> &ValidationReport {
        &self.report
    }

    /// Change id.
    pub fn id(&self) -> Uuid {
        self.change.id
    }

    /// Opportunity the change addresses.
    pub fn opportunity_id(&self) -> Option<Uuid> {
        self.change.opportunity_id
    }

    /// Files to activate.
    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.change.files
    }
}

/// Errors building a validator.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A deny-list pattern is not a valid regular expression.
    #[error("invalid deny pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The pattern.
        pattern: String,
        /// Regex error.
        #[source]
        source: regex::Error,
    },
}

// ─── Codebase graph ─────────────────────────────────────────────────────────

const ALWAYS_RESOLVED: [&str; 3] = ["std", "core", "alloc"];

/// Known modules and allowed external roots that imports resolve against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodebaseGraph {
    modules: BTreeSet<String>,
    external_roots: BTreeSet<String>,
}

impl CodebaseGraph {
    /// Empty graph; only `std`, `core` and `alloc` resolve.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module path (`crate::telemetry::buffer`, `pkg.module`, `lib/util`).
    pub fn with_module(mut self, path: impl Into<String>) -> Self {
        self.modules.insert(path.into());
        self
    }

    /// Allow every import rooted at `root` (an external dependency).
    pub fn with_external(mut self, root: impl Into<String>) -> Self {
        self.external_roots.insert(root.into());
        self
    }

    /// Return `true` if `import` resolves, treating `added` as known modules.
    pub fn resolves(&self, import: &str, added: &BTreeSet<String>) -> bool {
        let import = import.trim().trim_end_matches("::").trim_end_matches('*').trim_end_matches("::");
        if import == "crate"
            || import.starts_with('.')
            || import.starts_with("self::")
            || import.starts_with("super::")
        {
            return true;
        }
        let root = import
            .split(|c: char| c == ':' || c == '.' || c == '/')
            .next()
            .unwrap_or_default();
        if ALWAYS_RESOLVED.contains(&root) || self.external_roots.contains(root) {
            return true;
        }
        let known = |p: &str| self.modules.contains(p) || added.contains(p);
        let sep = if import.contains("::") {
            "::"
        } else if import.contains('/') {
            "/"
        } else {
            "."
        };
        let parts: Vec<&str> = import.split(sep).collect();
        (1..=parts.len())
            .rev()
            .map(|n| parts[..n].join(sep))
            .filter(|p| p != "crate")
            .any(|p| known(&p))
    }
}

/// Module paths a file adds to the graph.
fn modules_for_path(path: &str) -> Vec<String> {
    let path = path.trim_start_matches("./");
    if let Some(stem) = path.strip_suffix(".rs") {
        let inner = stem.strip_prefix("src/").unwrap_or(stem);
        let inner = inner.strip_suffix("/mod").unwrap_or(inner);
        if inner == "lib" || inner == "main" {
            return vec![];
        }
        return vec![format!("crate::{}", inner.replace('/', "::"))];
    }
    if let Some(stem) = path.strip_suffix(".py") {
        let stem = stem.strip_suffix("/__init__").unwrap_or(stem);
        return vec![stem.replace('/', ".")];
    }
    for ext in [".ts", ".js"] {
        if let Some(stem) = path.strip_suffix(ext) {
            return vec![stem.to_string()];
        }
    }
    vec![]
}

// ─── Lexical checks ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lang {
    Rust,
    Python,
    Script,
    Text,
}

impl Lang {
    fn of(path: &str) -> Self {
        match path.rsplit('.').next() {
            Some("rs") => Lang::Rust,
            Some("py") => Lang::Python,
            Some("ts") | Some("js") | Some("tsx") | Some("jsx") => Lang::Script,
            _ => Lang::Text,
        }
    }
}

/// Check that delimiters balance outside strings and comments.
fn check_well_formed(content: &str, lang: Lang) -> Result<(), String> {
    if content.trim().is_empty() {
        return Err("empty file".into());
    }
    if lang == Lang::Text {
        return Ok(());
    }

    let chars: Vec<char> = content.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1usize;
    let mut i = 0usize;

    let closing = |open: char| match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    };

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\n' => line += 1,
            '/' if lang != Lang::Python && next == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '#' if lang == Lang::Python => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if lang != Lang::Python && next == Some('*') => {
                let start = line;
                let mut depth = 1usize;
                i += 2;
                while i < chars.len() && depth > 0 {
                    match (chars[i], chars.get(i + 1).copied()) {
                        ('*', Some('/')) => {
                            depth -= 1;
                            i += 2;
                        }
                        ('/', Some('*')) if lang == Lang::Rust => {
                            depth += 1;
                            i += 2;
                        }
                        (ch, _) => {
                            if ch == '\n' {
                                line += 1;
                            }
                            i += 1;
                        }
                    }
                }
                if depth > 0 {
                    return Err(format!("unterminated block comment starting on line {start}"));
                }
                continue;
            }
            'r' if lang == Lang::Rust
                && (next == Some('"') || next == Some('#'))
                && !chars.get(i.wrapping_sub(1)).is_some_and(|p| p.is_alphanumeric() || *p == '_') =>
            {
                let mut j = i + 1;
                let mut hashes = 0usize;
                while chars.get(j) == Some(&'#') {
                    hashes += 1;
                    j += 1;
                }
                if chars.get(j) == Some(&'"') {
                    let start = line;
                    j += 1;
                    loop {
                        match chars.get(j) {
                            None => return Err(format!("unterminated raw string starting on line {start}")),
                            Some('"') if (1..=hashes).all(|k| chars.get(j + k) == Some(&'#')) => {
                                i = j + hashes + 1;
                                break;
                            }
                            Some(ch) => {
                                if *ch == '\n' {
                                    line += 1;
                                }
                                j += 1;
                            }
                        }
                    }
                    continue;
                }
            }
            '\'' if lang == Lang::Rust => {
                // Char literal or lifetime.
                if next == Some('\\') {
                    let mut j = i + 2;
                    while j < chars.len() && chars[j] != '\'' && chars[j] != '\n' {
                        j += 1;
                    }
                    if chars.get(j) != Some(&'\'') {
                        return Err(format!("unterminated char literal on line {line}"));
                    }
                    i = j + 1;
                    continue;
                }
                if chars.get(i + 2) == Some(&'\'') {
                    i += 3;
                    continue;
                }
            }
            '"' | '\'' | '`' => {
                let quote = c;
                let triple = lang == Lang::Python
                    && chars.get(i + 1) == Some(&quote)
                    && chars.get(i + 2) == Some(&quote);
                let start = line;
                let mut j = if triple { i + 3 } else { i + 1 };
                loop {
                    match chars.get(j) {
                        None => return Err(format!("unterminated string starting on line {start}")),
                        Some('\\') => j += 2,
                        Some(ch) if *ch == quote => {
                            if !triple {
                                j += 1;
                                break;
                            }
                            if chars.get(j + 1) == Some(&quote) && chars.get(j + 2) == Some(&quote) {
                                j += 3;
                                break;
                            }
                            j += 1;
                        }
                        Some('\n') if !triple && quote != '`' && lang != Lang::Rust => {
                            return Err(format!("unterminated string on line {start}"));
                        }
                        Some(ch) => {
                            if *ch == '\n' {
                                line += 1;
                            }
                            j += 1;
                        }
                    }
                }
                i = j;
                continue;
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => match stack.pop() {
                Some((open, _)) if closing(open) == c => {}
                Some((open, at)) => {
                    return Err(format!(
                        "mismatched '{c}' on line {line}, expected '{}' for '{open}' from line {at}",
                        closing(open)
                    ))
                }
                None => return Err(format!("unexpected '{c}' on line {line}")),
            },
            _ => {}
        }
        i += 1;
    }

    match stack.last() {
        Some((open, at)) => Err(format!("unclosed '{open}' from line {at}")),
        None => Ok(()),
    }
}

fn import_rules() -> &'static [(Lang, Regex)] {
    static RULES: OnceLock<Vec<(Lang, Regex)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (Lang::Rust, r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+([A-Za-z_][\w:]*)"),
            (Lang::Rust, r"(?m)^\s*extern\s+crate\s+([A-Za-z_]\w*)"),
            (Lang::Python, r"(?m)^\s*import\s+([\w\.]+)"),
            (Lang::Python, r"(?m)^\s*from\s+([\w\.]+)\s+import\b"),
            (Lang::Script, r#"(?m)\bfrom\s+['"]([^'"]+)['"]"#),
            (Lang::Script, r#"\brequire\(\s*['"]([^'"]+)['"]\s*\)"#),
        ]
        .into_iter()
        .filter_map(|(lang, p)| Regex::new(p).ok().map(|re| (lang, re)))
        .collect()
    })
}

fn imports_of(content: &str, lang: Lang) -> Vec<String> {
    import_rules()
        .iter()
        .filter(|(l, _)| *l == lang)
        .flat_map(|(_, re)| re.captures_iter(content).filter_map(|c| c.get(1)).map(|m| m.as_str().to_string()))
        .collect()
}

// ─── Quality ────────────────────────────────────────────────────────────────

fn quality_rules() -> Option<&'static (Regex, Regex)> {
    static RULES: OnceLock<Option<(Regex, Regex)>> = OnceLock::new();
    RULES
        .get_or_init(|| {
            let decisions = Regex::new(r"\b(if|elif|match|for|while|loop|case|catch|except)\b|&&|\|\|").ok()?;
            let functions = Regex::new(r"\b(fn|def|function)\b|=>").ok()?;
            Some((decisions, functions))
        })
        .as_ref()
}

/// Complexity component in `[0, 1]`.
fn complexity_score(files: &BTreeMap<String, String>, max_avg_decisions: f64) -> f64 {
    let Some((decisions_re, functions_re)) = quality_rules() else {
        return 1.0;
    };
    let decisions: usize = files.values().map(|c| decisions_re.find_iter(c).count()).sum();
    let functions: usize = files.values().map(|c| functions_re.find_iter(c).count()).sum();
    let avg = decisions as f64 / functions.max(1) as f64;
    if max_avg_decisions <= 0.0 {
        return 0.0;
    }
    (1.0 - avg / max_avg_decisions).clamp(0.0, 1.0)
}

/// Style component in `[0, 1]`: share of non-empty lines that fit the line
/// length, carry no trailing whitespace and are not tab-indented.
fn style_score(files: &BTreeMap<String, String>, max_line_length: usize) -> f64 {
    let mut total = 0usize;
    let mut ok = 0usize;
    for (path, content) in files {
        let tabs_matter = matches!(Lang::of(path), Lang::Rust | Lang::Python);
        for l in content.lines().filter(|l| !l.trim().is_empty()) {
            total += 1;
            let fits = l.chars().count() <= max_line_length;
            let trimmed = l.trim_end() == l;
            let indented = !(tabs_matter && l.starts_with('\t'));
            if fits && trimmed && indented {
                ok += 1;
            }
        }
    }
    if total == 0 {
        0.0
    } else {
        ok as f64 / total as f64
    }
}

// ─── Validator ──────────────────────────────────────────────────────────────

/// Static validator for generated changes.
#[derive(Debug, Clone)]
pub struct ChangeValidator {
    config: ValidationConfig,
    deny: Vec<(String, Regex)>,
    graph: CodebaseGraph,
}

impl ChangeValidator {
    /// Build a validator, compiling the deny-list.
    ///
    /// # Errors
    /// Returns [`ValidationError::InvalidPattern`] for the first deny pattern
    /// that does not compile.
    pub fn new(config: ValidationConfig, graph: CodebaseGraph) -> Result<Self, ValidationError> {
        let deny = config
            .deny_patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map(|re| (p.clone(), re))
                    .map_err(|source| ValidationError::InvalidPattern {
                        pattern: p.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { config, deny, graph })
    }

    /// Graph imports are resolved against.
    pub fn graph(&self) -> &CodebaseGraph {
        &self.graph
    }

    /// Run every check on `change`.
    ///
    /// # Errors
    /// Returns [`ValidationRejection`] listing every failed check. A rejected
    /// change is discarded by the caller and never retried in the same cycle.
    pub fn validate(&self, change: GeneratedChange) -> Result<ValidatedChange, ValidationRejection> {
        let mut reasons = Vec::new();
        if change.files.is_empty() {
            reasons.push(RejectionReason::EmptyChange);
        }

        let added: BTreeSet<String> = change.files.keys().flat_map(|p| modules_for_path(p)).collect();

        let mut syntax_ok = true;
        let mut imports_ok = true;
        let mut security_ok = true;
        for (path, content) in &change.files {
            let lang = Lang::of(path);
            if let Err(detail) = check_well_formed(content, lang) {
                syntax_ok = false;
                reasons.push(RejectionReason::Syntax {
                    file: path.clone(),
                    detail,
                });
            }
            for import in imports_of(content, lang) {
                if !self.graph.resolves(&import, &added) {
                    imports_ok = false;
                    reasons.push(RejectionReason::UnresolvedImport {
                        file: path.clone(),
                        import,
                    });
                }
            }
            for (pattern, re) in &self.deny {
                if re.is_match(content) {
                    security_ok = false;
                    reasons.push(RejectionReason::SecurityViolation {
                        file: path.clone(),
                        pattern: pattern.clone(),
                    });
                }
            }
        }

        let quality_score = 0.6 * complexity_score(&change.files, self.config.max_avg_decisions)
            + 0.4 * style_score(&change.files, self.config.max_line_length);
        if quality_score < self.config.quality_threshold {
            reasons.push(RejectionReason::QualityBelowThreshold {
                score: quality_score,
                threshold: self.config.quality_threshold,
            });
        }

        let report = ValidationReport {
            syntax_ok,
            imports_ok,
            security_ok,
            quality_score,
        };

        if reasons.is_empty() {
            info!(
                change_id = %change.id,
                files = change.files.len(),
                quality = quality_score,
                "change validated"
            );
            return Ok(ValidatedChange { change, report });
        }

        for r in &reasons {
            metrics::inc_validation_rejection(r.label());
        }
        let rejection = ValidationRejection {
            change_id: change.id,
            opportunity_id: change.opportunity_id,
            report,
            reasons,
        };
        warn!(change_id = %change.id, error = %rejection, "change rejected");
        Err(rejection)
    }
}
