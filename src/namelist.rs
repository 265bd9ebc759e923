//! Fortran namelist documents and the patch layer
//!
//! A namelist is a sequence of groups:
//!
//! ```text
//! &namrun        !   parameters of the run
//!    nn_it000    =       1   !  first time step
//!    cn_exp      =  "ASF"
//! /
//! ```
//!
//! Patching is a deep merge over group → parameter → scalar. Lines that a patch
//! does not name are carried through untouched, byte for byte, including
//! comments, blank lines and array values this module never interprets.
//! Unknown groups and parameters are added rather than rejected; the model
//! executable is the one that validates a namelist when it loads it.
//!
//! Documents are never edited in place: the patched text is written to a
//! sibling temp file which is then renamed over the target.

use crate::error::{IoContext, Result, StageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A scalar namelist value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Parse a Fortran literal (`.true.`, `3`, `2.5d0`, `'text'`).
    ///
    /// Returns `None` for anything that is not a single scalar, such as the
    /// comma-separated structures NEMO uses for input file descriptors.
    pub fn parse_fortran(raw: &str) -> Option<Self> {
        let raw = raw.trim().trim_end_matches(',').trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(s) = unquote(raw) {
            return Some(Self::Str(s));
        }
        match raw.to_ascii_lowercase().as_str() {
            ".true." | ".t." | "t" => return Some(Self::Bool(true)),
            ".false." | ".f." | "f" => return Some(Self::Bool(false)),
            _ => {}
        }
        if let Ok(i) = raw.parse::<i64>() {
            return Some(Self::Int(i));
        }
        let normalized = raw.replace(['d', 'D'], "e");
        normalized.parse::<f64>().ok().map(Self::Float)
    }

    /// Parse a value typed on the command line.
    ///
    /// Accepts everything [`Value::parse_fortran`] does plus `true`/`false`
    /// in any case; anything else becomes a string.
    pub fn from_cli(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            _ => {}
        }
        Self::parse_fortran(raw).unwrap_or_else(|| Self::Str(raw.trim().to_string()))
    }

    /// Render as Fortran namelist text
    pub fn to_fortran(&self) -> String {
        match self {
            Self::Bool(true) => ".true.".to_string(),
            Self::Bool(false) => ".false.".to_string(),
            Self::Int(i) => i.to_string(),
            // Debug keeps a decimal point on whole numbers (2000.0, not 2000)
            Self::Float(x) => format!("{:?}", x),
            Self::Str(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_fortran())
    }
}

fn unquote(raw: &str) -> Option<String> {
    for q in ['\'', '"'] {
        if raw.len() >= 2 && raw.starts_with(q) && raw.ends_with(q) {
            let inner = &raw[1..raw.len() - 1];
            let doubled = format!("{q}{q}");
            // a lone quote inside means this is not one string literal
            if inner.replace(&doubled, "").contains(q) {
                return None;
            }
            return Some(inner.replace(&doubled, &q.to_string()));
        }
    }
    None
}

/// Group name → parameter name → new value.
///
/// Names are matched case-insensitively against the document.
pub type Patch = BTreeMap<String, BTreeMap<String, Value>>;

/// Convenience for building a one-group patch
pub fn single_group_patch<I, K>(group: &str, params: I) -> Patch
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    let mut patch = Patch::new();
    patch.insert(
        group.to_string(),
        params.into_iter().map(|(k, v)| (k.into(), v)).collect(),
    );
    patch
}

/// Parse `group.param=value` as given to the `patch` subcommand
pub fn parse_assignment(s: &str) -> std::result::Result<(String, String, Value), String> {
    let (lhs, rhs) = s
        .split_once('=')
        .ok_or_else(|| format!("expected group.param=value, got '{}'", s))?;
    let (group, param) = lhs
        .trim()
        .split_once('.')
        .ok_or_else(|| format!("expected group.param on the left of '=', got '{}'", lhs))?;
    if group.is_empty() || param.is_empty() {
        return Err(format!("empty group or parameter name in '{}'", s));
    }
    Ok((group.to_string(), param.to_string(), Value::from_cli(rhs)))
}

/// What a span of a line holds
#[derive(Debug, Clone, PartialEq, Eq)]
enum Item {
    /// `&group`
    Open(String),
    /// `name = value` inside `group`
    Param { group: String, name: String },
    /// Value text continued from the previous parameter
    Continuation { group: String, name: String },
    /// `/` or `&end`
    Close(String),
}

/// A byte range of a line's code part
#[derive(Debug, Clone)]
struct Segment {
    start: usize,
    end: usize,
    item: Item,
}

/// One physical line. A line may carry several segments
/// (`&namtrd ln_dyn_trd = .false. /`) or none (blank lines, comments).
#[derive(Debug, Clone)]
struct Line {
    text: String,
    segments: Vec<Segment>,
}

impl Line {
    fn param(indent: &str, group: &str, name: &str, value: &Value) -> Self {
        let assignment = format!("{} = {}", name, value.to_fortran());
        Self {
            text: format!("{}{}", indent, assignment),
            segments: vec![Segment {
                start: indent.len(),
                end: indent.len() + assignment.len(),
                item: Item::Param {
                    group: group.to_string(),
                    name: name.to_ascii_lowercase(),
                },
            }],
        }
    }

    fn slice(&self, seg: &Segment) -> &str {
        &self.text[seg.start..seg.end]
    }

    /// True when only whitespace precedes the segment
    fn starts_with(&self, seg: &Segment) -> bool {
        self.text[..seg.start].trim().is_empty()
    }

    /// Replace the text of segment `idx`, shifting the segments after it
    fn splice(&mut self, idx: usize, replacement: &str) {
        let (start, end) = (self.segments[idx].start, self.segments[idx].end);
        self.text.replace_range(start..end, replacement);
        let new_end = start + replacement.len();
        self.segments[idx].end = new_end;
        for seg in &mut self.segments[idx + 1..] {
            seg.start = seg.start - end + new_end;
            seg.end = seg.end - end + new_end;
        }
    }

    /// Split before segment `idx`: the head keeps everything before it,
    /// the tail (re-indented like the head) gets the rest
    fn split_before(mut self, idx: usize) -> (Line, Line) {
        let at = self.segments[idx].start;
        let indent = indent_of(&self.text).to_string();
        let mut tail_segments = self.segments.split_off(idx);
        for seg in &mut tail_segments {
            seg.start = seg.start - at + indent.len();
            seg.end = seg.end - at + indent.len();
        }
        let tail = Line {
            text: format!("{}{}", indent, &self.text[at..]),
            segments: tail_segments,
        };
        self.text.truncate(at);
        self.text.truncate(self.text.trim_end().len());
        (self, tail)
    }
}

/// A parsed namelist that remembers its exact source text
#[derive(Debug, Clone)]
pub struct ConfigDocument {
    lines: Vec<Line>,
    trailing_newline: bool,
}

/// Split a line into its code part and its `!` comment, ignoring `!` in quotes
fn split_comment(line: &str) -> (&str, Option<&str>) {
    let mut quote: Option<char> = None;
    for (i, c) in line.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == '!' => return (&line[..i], Some(&line[i..])),
            None => {}
        }
    }
    (line, None)
}

fn find_unquoted(code: &str, needle: char) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in code.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == needle => return Some(i),
            None => {}
        }
    }
    None
}

/// Scan a group body from `from`: unquoted `=` offsets, and where the body
/// stops (an unquoted `/` or `&`), if it stops on this line
fn scan_body(code: &str, from: usize) -> (Vec<usize>, Option<usize>) {
    let mut quote: Option<char> = None;
    let mut eqs = Vec::new();
    for (i, c) in code[from..].char_indices() {
        let i = from + i;
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == '=' => eqs.push(i),
            None if c == '/' || c == '&' => return (eqs, Some(i)),
            None => {}
        }
    }
    (eqs, None)
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '%' | '(' | ')' | ':')
}

fn is_separator(c: char) -> bool {
    c.is_whitespace() || c == ','
}

/// Start of the parameter name that ends just before the `=` at `eq`
fn name_start(code: &str, lo: usize, eq: usize) -> usize {
    lo + code[lo..eq].trim_end().trim_end_matches(is_name_char).len()
}

/// `lo..hi` with separators trimmed from both ends, `None` if nothing is left
fn trimmed_span(code: &str, lo: usize, hi: usize) -> Option<(usize, usize)> {
    let text = &code[lo..hi];
    let start = lo + (text.len() - text.trim_start_matches(is_separator).len());
    let end = lo + text.trim_end_matches(is_separator).len();
    (start < end).then_some((start, end))
}

fn indent_of(text: &str) -> &str {
    &text[..text.len() - text.trim_start().len()]
}

/// Group state carried from one line to the next while parsing
#[derive(Default)]
struct Scanner {
    current: Option<String>,
    last_param: Option<String>,
}

impl Scanner {
    fn line(&mut self, raw: &str) -> std::result::Result<Vec<Segment>, &'static str> {
        let (code, _) = split_comment(raw);
        let mut segments = Vec::new();
        let mut pos = 0;

        loop {
            let Some(group) = self.current.clone() else {
                // outside a group only a header counts, anything else is commentary
                let rest = &code[pos..];
                let Some(after) = rest.trim_start().strip_prefix('&') else {
                    break;
                };
                let start = pos + rest.len() - after.len() - 1;
                let name_len = after
                    .find(|c: char| c.is_whitespace() || c == '/' || c == ',')
                    .unwrap_or(after.len());
                if name_len == 0 {
                    return Err("group header without a name");
                }
                let name = after[..name_len].to_ascii_lowercase();
                pos = start + 1 + name_len;
                segments.push(Segment {
                    start,
                    end: pos,
                    item: Item::Open(name.clone()),
                });
                self.current = Some(name);
                self.last_param = None;
                continue;
            };

            let (eqs, stop) = scan_body(code, pos);
            let body_end = stop.unwrap_or(code.len());

            let mut starts = Vec::with_capacity(eqs.len());
            for eq in eqs {
                let start = name_start(code, pos, eq);
                let name = code[start..eq].trim();
                if name.is_empty() {
                    return Err("assignment without a parameter name");
                }
                starts.push((start, name.to_ascii_lowercase()));
            }

            let first = starts.first().map_or(body_end, |(start, _)| *start);
            if let Some((start, end)) = trimmed_span(code, pos, first) {
                let name = self
                    .last_param
                    .clone()
                    .ok_or("value without a parameter name")?;
                segments.push(Segment {
                    start,
                    end,
                    item: Item::Continuation {
                        group: group.clone(),
                        name,
                    },
                });
            }

            for (i, (start, name)) in starts.iter().enumerate() {
                let next = starts.get(i + 1).map_or(body_end, |(s, _)| *s);
                let end = start + code[*start..next].trim_end_matches(is_separator).len();
                segments.push(Segment {
                    start: *start,
                    end,
                    item: Item::Param {
                        group: group.clone(),
                        name: name.clone(),
                    },
                });
                self.last_param = Some(name.clone());
            }

            let Some(at) = stop else { break };
            let end = if code[at..].starts_with('/') {
                at + 1
            } else {
                let word = &code[at + 1..];
                let len = word
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(word.len());
                if !word[..len].eq_ignore_ascii_case("end") {
                    return Err("group opened before the previous one was closed");
                }
                at + 1 + len
            };
            segments.push(Segment {
                start: at,
                end,
                item: Item::Close(group),
            });
            self.current = None;
            pos = end;
        }

        Ok(segments)
    }
}

impl ConfigDocument {
    /// Parse namelist text. `origin` is only used in error messages.
    ///
    /// Several assignments may share a line, a header may carry assignments,
    /// and the terminator may follow the last value on the same line.
    pub fn parse(text: &str, origin: &Path) -> Result<Self> {
        let trailing_newline = text.ends_with('\n');
        let body = text.strip_suffix('\n').unwrap_or(text);
        let mut scanner = Scanner::default();
        let mut lines = Vec::new();

        let err = |line: usize, reason: &str| StageError::Namelist {
            path: origin.to_path_buf(),
            line,
            reason: reason.to_string(),
        };

        for (idx, raw) in body.split('\n').enumerate() {
            let segments = scanner.line(raw).map_err(|reason| err(idx + 1, reason))?;
            lines.push(Line {
                text: raw.to_string(),
                segments,
            });
        }

        if let Some(group) = scanner.current {
            return Err(err(lines.len(), &format!("group &{} is never closed", group)));
        }

        Ok(Self {
            lines,
            trailing_newline,
        })
    }

    /// Read and parse a namelist file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StageError::missing_document(path));
        }
        let text = fs::read_to_string(path).at(path)?;
        Self::parse(&text, path)
    }

    /// Group names in document order (lowercase, duplicates kept once)
    pub fn groups(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for seg in self.lines.iter().flat_map(|l| &l.segments) {
            if let Item::Open(g) = &seg.item {
                if !out.contains(g) {
                    out.push(g.clone());
                }
            }
        }
        out
    }

    /// The raw value text of a parameter, continuation lines included
    pub fn raw(&self, group: &str, name: &str) -> Option<String> {
        let (group, name) = (group.to_ascii_lowercase(), name.to_ascii_lowercase());
        let mut out: Option<String> = None;
        for line in &self.lines {
            for seg in &line.segments {
                match &seg.item {
                    Item::Param { group: g, name: n } if *g == group && *n == name => {
                        let text = line.slice(seg);
                        let eq = find_unquoted(text, '=')?;
                        out = Some(text[eq + 1..].trim().to_string());
                    }
                    Item::Continuation { group: g, name: n } if *g == group && *n == name => {
                        if let Some(acc) = out.as_mut() {
                            acc.push_str(", ");
                            acc.push_str(line.slice(seg));
                        }
                    }
                    _ => {}
                }
            }
        }
        out
    }

    /// A parameter's value if it is a single scalar
    pub fn get(&self, group: &str, name: &str) -> Option<Value> {
        self.raw(group, name).and_then(|raw| Value::parse_fortran(&raw))
    }

    /// Deep-merge `patch` into the document
    pub fn apply(&mut self, patch: &Patch) {
        for (group, params) in patch {
            let group_lc = group.to_ascii_lowercase();
            for (name, value) in params {
                let name_lc = name.to_ascii_lowercase();
                if !self.replace_param(&group_lc, &name_lc, value) {
                    self.insert_param(group, &group_lc, name, value);
                }
            }
        }
    }

    /// Rewrite every `name = ...` span of the parameter; the rest of its line stays as is
    fn replace_param(&mut self, group: &str, name: &str, value: &Value) -> bool {
        let mut found = false;
        let mut out = Vec::with_capacity(self.lines.len());
        for mut line in self.lines.drain(..) {
            let mut emptied = false;
            let mut i = 0;
            while i < line.segments.len() {
                let hit = match &line.segments[i].item {
                    Item::Param { group: g, name: n } if g == group && n == name => Some(true),
                    Item::Continuation { group: g, name: n } if g == group && n == name => {
                        Some(false)
                    }
                    _ => None,
                };
                match hit {
                    Some(true) => {
                        let written = line
                            .slice(&line.segments[i])
                            .split('=')
                            .next()
                            .map(str::trim)
                            .unwrap_or(name)
                            .to_string();
                        line.splice(i, &format!("{} = {}", written, value.to_fortran()));
                        found = true;
                        i += 1;
                    }
                    // the old value's continuation goes with it
                    Some(false) => {
                        line.splice(i, "");
                        line.segments.remove(i);
                        emptied = true;
                    }
                    None => i += 1,
                }
            }
            let leftover = split_comment(&line.text).0.trim_matches(is_separator);
            if emptied && line.segments.is_empty() && leftover.is_empty() {
                continue;
            }
            out.push(line);
        }
        self.lines = out;
        found
    }

    fn insert_param(&mut self, group_written: &str, group: &str, name: &str, value: &Value) {
        let close_item = Item::Close(group.to_string());
        let close = self.lines.iter().enumerate().find_map(|(li, line)| {
            line.segments
                .iter()
                .position(|s| s.item == close_item)
                .map(|si| (li, si))
        });

        // unknown group: append a new block
        let Some((li, si)) = close else {
            self.lines.push(Line {
                text: format!("&{}", group_written),
                segments: vec![Segment {
                    start: 0,
                    end: group_written.len() + 1,
                    item: Item::Open(group.to_string()),
                }],
            });
            self.lines.push(Line::param("   ", group, name, value));
            self.lines.push(Line {
                text: "/".to_string(),
                segments: vec![Segment {
                    start: 0,
                    end: 1,
                    item: close_item,
                }],
            });
            return;
        };

        // indent like the group's own parameter lines, else one step in from the header
        let mut indent = "   ".to_string();
        for line in &self.lines[..=li] {
            for seg in &line.segments {
                if !line.starts_with(seg) {
                    continue;
                }
                match &seg.item {
                    Item::Open(g) if g == group => {
                        indent = format!("{}   ", indent_of(&line.text));
                    }
                    Item::Param { group: g, .. } if g == group => {
                        indent = indent_of(&line.text).to_string();
                    }
                    _ => {}
                }
            }
        }

        let new_line = Line::param(&indent, group, name, value);
        if self.lines[li].starts_with(&self.lines[li].segments[si]) {
            self.lines.insert(li, new_line);
        } else {
            // `&group /` or `x = 1 /`: break the terminator onto its own line
            let (head, tail) = self.lines.remove(li).split_before(si);
            self.lines.insert(li, tail);
            self.lines.insert(li, new_line);
            self.lines.insert(li, head);
        }
    }

    /// The document as text
    pub fn render(&self) -> String {
        let mut out = self
            .lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if self.trailing_newline {
            out.push('\n');
        }
        out
    }
}

impl fmt::Display for ConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Sibling path used while a patch is being written: `namelist_cfg` → `namelist_cfg_new`
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push("_new");
    path.with_file_name(name)
}

/// Patch a namelist in place.
///
/// An empty patch is skipped without touching (or even looking for) the file,
/// so callers can pass "maybe empty" patches unconditionally.
pub fn patch(path: &Path, patch: &Patch) -> Result<()> {
    patch_to(path, patch, path)
}

/// Patch `input` and write the result to `output` (which may equal `input`).
///
/// The result is first written to `<output>_new`, then renamed over `output`.
pub fn patch_to(input: &Path, patch: &Patch, output: &Path) -> Result<()> {
    if patch.values().all(|params| params.is_empty()) {
        debug!("Empty patch for {}, skipping", input.display());
        return Ok(());
    }

    let mut doc = ConfigDocument::load(input)?;
    info!(
        "Patching namelist {} with {} group(s): {:?}",
        input.display(),
        patch.len(),
        patch
    );
    doc.apply(patch);

    let tmp = staging_path(output);
    fs::write(&tmp, doc.render()).at(&tmp)?;
    fs::rename(&tmp, output).at(output)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAMELIST: &str = "\
!! NEMO reference namelist
&namrun        !   parameters of the run
!-----------------------------------------------------------------------
   cn_exp      =  \"ASF\"    !  experience name
   nn_it000    =       1   !  first time step
   ln_rstart   = .false.   !  start from rest
   sn_tem      = 'TS_init', -12, 'votemper', .false., .true., 'yearly'
/
&namsbc_ssr    !   surface boundary condition : sea surface restoring
   rn_deds     =  -166.67
   sn_sss      = 'sss_data',
                 -1, 'sosaline'
/
&namtrd /
";

    fn doc() -> ConfigDocument {
        ConfigDocument::parse(NAMELIST, Path::new("namelist_ref")).unwrap()
    }

    #[test]
    fn test_parse_groups_and_scalars() {
        let doc = doc();
        assert_eq!(doc.groups(), vec!["namrun", "namsbc_ssr", "namtrd"]);
        assert_eq!(doc.get("namrun", "cn_exp"), Some(Value::Str("ASF".into())));
        assert_eq!(doc.get("NAMRUN", "NN_IT000"), Some(Value::Int(1)));
        assert_eq!(doc.get("namrun", "ln_rstart"), Some(Value::Bool(false)));
        assert_eq!(doc.get("namsbc_ssr", "rn_deds"), Some(Value::Float(-166.67)));
        // structured descriptors are not scalars
        assert_eq!(doc.get("namrun", "sn_tem"), None);
        assert!(doc.raw("namrun", "sn_tem").unwrap().contains("votemper"));
    }

    #[test]
    fn test_unpatched_render_is_identical() {
        assert_eq!(doc().render(), NAMELIST);
    }

    #[test]
    fn test_replace_keeps_indent_and_comment() {
        let mut doc = doc();
        doc.apply(&single_group_patch("namrun", [("nn_it000", Value::Int(5841))]));
        let text = doc.render();
        assert!(text.contains("   nn_it000 = 5841   !  first time step"));
        assert!(!text.contains("=       1"));
    }

    #[test]
    fn test_replace_drops_continuation_lines() {
        let mut doc = doc();
        doc.apply(&single_group_patch(
            "namsbc_ssr",
            [("sn_sss", Value::Str("none".into()))],
        ));
        let text = doc.render();
        assert!(text.contains("sn_sss = 'none'"));
        assert!(!text.contains("'sosaline'"));
    }

    #[test]
    fn test_unknown_param_inserted_before_terminator() {
        let mut doc = doc();
        doc.apply(&single_group_patch("namrun", [("ln_new", Value::Bool(true))]));
        assert_eq!(doc.get("namrun", "ln_new"), Some(Value::Bool(true)));
        let text = doc.render();
        let ins = text.find("ln_new = .true.").unwrap();
        let close = text[ins..].find("\n/").unwrap();
        assert!(close > 0);
        assert!(text[..ins].contains("sn_tem"));
    }

    #[test]
    fn test_empty_group_is_split_open() {
        let mut doc = doc();
        doc.apply(&single_group_patch("namtrd", [("ln_dyn_trd", Value::Bool(true))]));
        assert_eq!(doc.get("namtrd", "ln_dyn_trd"), Some(Value::Bool(true)));
        assert!(doc.render().contains("&namtrd\n   ln_dyn_trd = .true.\n/"));
    }

    #[test]
    fn test_unknown_group_appended() {
        let mut doc = doc();
        doc.apply(&single_group_patch(
            "namtra_eiv",
            [("ln_ldfeiv", Value::Bool(true))],
        ));
        assert_eq!(doc.get("namtra_eiv", "ln_ldfeiv"), Some(Value::Bool(true)));
        assert!(doc.render().ends_with("&namtra_eiv\n   ln_ldfeiv = .true.\n/\n"));
    }

    #[test]
    fn test_value_rendering() {
        assert_eq!(Value::Float(2000.0).to_fortran(), "2000.0");
        assert_eq!(Value::Float(0.038356948).to_fortran(), "0.038356948");
        assert_eq!(Value::Str("it's".into()).to_fortran(), "'it''s'");
        assert_eq!(Value::parse_fortran("'it''s'"), Some(Value::Str("it's".into())));
        assert_eq!(Value::parse_fortran("1.5d3"), Some(Value::Float(1500.0)));
        assert_eq!(Value::parse_fortran(".TRUE."), Some(Value::Bool(true)));
    }

    #[test]
    fn test_values_from_json_patch() {
        let patch: Patch = serde_json::from_str(
            r#"{"namcfg": {"jpiglo": 257, "ln_isfcav": false, "pphmax": 2000.0, "cn_cfg": "asf"}}"#,
        )
        .unwrap();
        let g = &patch["namcfg"];
        assert_eq!(g["jpiglo"], Value::Int(257));
        assert_eq!(g["ln_isfcav"], Value::Bool(false));
        assert_eq!(g["pphmax"], Value::Float(2000.0));
        assert_eq!(g["cn_cfg"], Value::Str("asf".into()));
    }

    #[test]
    fn test_parse_assignment() {
        let (g, p, v) = parse_assignment("namtrd.ln_dyn_trd=True").unwrap();
        assert_eq!((g.as_str(), p.as_str()), ("namtrd", "ln_dyn_trd"));
        assert_eq!(v, Value::Bool(true));
        assert!(parse_assignment("namtrd=1").is_err());
        assert!(parse_assignment("nope").is_err());
    }

    #[test]
    fn test_unclosed_group_is_an_error() {
        let err = ConfigDocument::parse("&namrun\n  a = 1\n", Path::new("x")).unwrap_err();
        assert!(matches!(err, StageError::Namelist { .. }));
    }

    #[test]
    fn test_several_assignments_on_one_line() {
        let text = "&namrun\n   nn_it000 = 1, nn_itend = 5840   ! steps\n/\n";
        let mut doc = ConfigDocument::parse(text, Path::new("x")).unwrap();
        assert_eq!(doc.raw("namrun", "nn_itend").as_deref(), Some("5840"));
        assert_eq!(doc.get("namrun", "nn_it000"), Some(Value::Int(1)));

        doc.apply(&single_group_patch("namrun", [("nn_it000", Value::Int(9))]));
        assert_eq!(
            doc.render(),
            "&namrun\n   nn_it000 = 9, nn_itend = 5840   ! steps\n/\n"
        );
        doc.apply(&single_group_patch("namrun", [("NN_ITEND", Value::Int(10))]));
        assert_eq!(
            doc.render(),
            "&namrun\n   nn_it000 = 9, nn_itend = 10   ! steps\n/\n"
        );
    }

    #[test]
    fn test_quoted_separators_stay_in_value() {
        let doc =
            ConfigDocument::parse("&namrun\n   cn_exp = 'a, b = c / d'\n/\n", Path::new("x")).unwrap();
        assert_eq!(doc.get("namrun", "cn_exp"), Some(Value::Str("a, b = c / d".into())));
    }

    #[test]
    fn test_assignments_on_header_line() {
        let text = "&namtrd ln_dyn_trd = .false. /\n";
        let doc = ConfigDocument::parse(text, Path::new("x")).unwrap();
        assert_eq!(doc.groups(), vec!["namtrd"]);
        assert_eq!(doc.get("namtrd", "ln_dyn_trd"), Some(Value::Bool(false)));
        assert_eq!(doc.render(), text);

        let mut replaced = doc.clone();
        replaced.apply(&single_group_patch("namtrd", [("ln_dyn_trd", Value::Bool(true))]));
        assert_eq!(replaced.render(), "&namtrd ln_dyn_trd = .true. /\n");

        let mut inserted = doc;
        inserted.apply(&single_group_patch("namtrd", [("ln_tra_trd", Value::Bool(true))]));
        assert_eq!(
            inserted.render(),
            "&namtrd ln_dyn_trd = .false.\n   ln_tra_trd = .true.\n/\n"
        );
    }

    #[test]
    fn test_terminator_after_last_value() {
        let text = "&namdom\n   ppkth = 0.0 /\n&namcfg\n   jpiglo = 10\n/\n";
        let mut doc = ConfigDocument::parse(text, Path::new("x")).unwrap();
        assert_eq!(doc.groups(), vec!["namdom", "namcfg"]);
        assert_eq!(doc.get("namdom", "ppkth"), Some(Value::Float(0.0)));

        doc.apply(&single_group_patch("namdom", [("rn_bot", Value::Int(1))]));
        assert_eq!(
            doc.render(),
            "&namdom\n   ppkth = 0.0\n   rn_bot = 1\n   /\n&namcfg\n   jpiglo = 10\n/\n"
        );
        assert_eq!(doc.get("namcfg", "jpiglo"), Some(Value::Int(10)));
    }

    #[test]
    fn test_end_terminator() {
        let doc = ConfigDocument::parse("&namrun\n  a = 1\n&END\n&namdom b = 2 &end\n", Path::new("x"))
            .unwrap();
        assert_eq!(doc.groups(), vec!["namrun", "namdom"]);
        assert_eq!(doc.get("namrun", "a"), Some(Value::Int(1)));
        assert_eq!(doc.get("namdom", "b"), Some(Value::Int(2)));
    }

    #[test]
    fn test_nested_group_is_an_error() {
        let err =
            ConfigDocument::parse("&namrun\n  a = 1\n&namdom\n/\n", Path::new("x")).unwrap_err();
        assert!(matches!(err, StageError::Namelist { line: 3, .. }));
        let err = ConfigDocument::parse("&namrun\n  = 1\n/\n", Path::new("x")).unwrap_err();
        assert!(matches!(err, StageError::Namelist { line: 2, .. }));
    }

    #[test]
    fn test_patch_file_roundtrip_and_empty_patch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("namelist_cfg");

        // empty patch never looks for the file
        patch(&path, &Patch::new()).unwrap();
        assert!(!path.exists());

        let err = patch(
            &path,
            &single_group_patch("namrun", [("nn_it000", Value::Int(2))]),
        )
        .unwrap_err();
        assert!(matches!(err, StageError::MissingDocument { .. }));

        fs::write(&path, NAMELIST).unwrap();
        patch(
            &path,
            &single_group_patch("namrun", [("nn_it000", Value::Int(2))]),
        )
        .unwrap();
        assert!(!staging_path(&path).exists());
        let doc = ConfigDocument::load(&path).unwrap();
        assert_eq!(doc.get("namrun", "nn_it000"), Some(Value::Int(2)));
    }

    #[test]
    fn test_staging_path() {
        assert_eq!(
            staging_path(Path::new("/run/namelist_ref")),
            PathBuf::from("/run/namelist_ref_new")
        );
    }
}
