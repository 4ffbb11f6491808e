use thiserror::Error;

/// Errors raised on malformed unified diff text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: malformed hunk header '{header}'")]
    MalformedHunkHeader { line: usize, header: String },
    #[error("line {line}: unexpected content inside hunk: '{content}'")]
    UnexpectedLine { line: usize, content: String },
    #[error("hunk starting at line {line} ends before its declared length")]
    TruncatedHunk { line: usize },
    #[error("line {line}: hunk outside of a file section")]
    OrphanHunk { line: usize },
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// Kind of a single diff line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Del,
    Normal,
}

/// One line of a hunk body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Line present only in the new version, numbered in the new file.
    Add { ln: u32, content: String },
    /// Line present only in the old version, numbered in the old file.
    Del { ln: u32, content: String },
    /// Unchanged context line; `ln1` in the old file, `ln2` in the new file.
    Normal { ln1: u32, ln2: u32, content: String },
}

impl Change {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Add { .. } => ChangeKind::Add,
            Change::Del { .. } => ChangeKind::Del,
            Change::Normal { .. } => ChangeKind::Normal,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Change::Add { content, .. }
            | Change::Del { content, .. }
            | Change::Normal { content, .. } => content,
        }
    }
}

/// A single `@@` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: u32,
    pub old_lines: u32,
    pub new_start: u32,
    pub new_lines: u32,
    pub changes: Vec<Change>,
}

/// The changes to one file between two commits.
///
/// `from` is `None` for created files, `to` is `None` for deleted files.
/// The paths differ when the file was renamed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub from: Option<String>,
    pub to: Option<String>,
    pub hunks: Vec<Hunk>,
}

impl FileDiff {
    pub fn from_path(&self) -> Option<&str> {
        self.from.as_deref()
    }

    pub fn to_path(&self) -> Option<&str> {
        self.to.as_deref()
    }

    /// Iterate every change of every hunk in file order.
    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.hunks.iter().flat_map(|h| h.changes.iter())
    }
}

/// Parse raw unified diff output (as produced by `git diff` or the platform's
/// compare endpoint) into per-file diffs.
///
/// Git extended headers (renames, created and deleted files) are honoured.
/// Binary files are skipped. Pure renames are kept with no hunks.
/// Hunk bodies are consumed according to the counts in their header, so a
/// body that ends early or contains an unprefixed line is an error.
pub fn parse_diff(input: &str) -> Result<Vec<FileDiff>> {
    let lines: Vec<&str> = input.lines().collect();
    let mut files = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        if line.starts_with("diff --git ") {
            let (file, next) = parse_file(&lines, i)?;
            if let Some(file) = file {
                files.push(file);
            }
            i = next;
        } else if line.starts_with("@@") {
            return Err(ParseError::OrphanHunk { line: i + 1 });
        } else {
            // Preamble such as a format-patch mail header
            i += 1;
        }
    }

    Ok(files)
}

/// Parse one file section starting at its `diff --git` line.
///
/// Returns the file (or `None` for binary files) and the index of the first
/// line after the section.
fn parse_file(lines: &[&str], start: usize) -> Result<(Option<FileDiff>, usize)> {
    let (mut from, mut to) = git_header_paths(lines[start]);
    let mut hunks = Vec::new();
    let mut is_binary = false;
    let mut i = start + 1;

    while i < lines.len() {
        let current = lines[i];

        if current.starts_with("diff --git ") {
            break;
        }

        if current.starts_with("@@") {
            let (hunk, next) = parse_hunk(lines, i)?;
            hunks.push(hunk);
            i = next;
            continue;
        }

        if !hunks.is_empty() {
            if current.trim().is_empty() {
                i += 1;
                continue;
            }
            return Err(ParseError::UnexpectedLine {
                line: i + 1,
                content: current.to_string(),
            });
        }

        if let Some(path) = current.strip_prefix("rename from ") {
            from = Some(path.to_string());
        } else if let Some(path) = current.strip_prefix("rename to ") {
            to = Some(path.to_string());
        } else if current.starts_with("new file mode") {
            from = None;
        } else if current.starts_with("deleted file mode") {
            to = None;
        } else if current.starts_with("Binary files ") || current.starts_with("GIT binary patch") {
            is_binary = true;
        } else if let Some(path) = current.strip_prefix("--- ") {
            from = marker_path(path, "a/");
        } else if let Some(path) = current.strip_prefix("+++ ") {
            to = marker_path(path, "b/");
        }

        i += 1;
    }

    if is_binary {
        return Ok((None, i));
    }

    Ok((Some(FileDiff { from, to, hunks }), i))
}

/// Best-effort paths from a `diff --git a/<from> b/<to>` line.
fn git_header_paths(header: &str) -> (Option<String>, Option<String>) {
    let rest = header.strip_prefix("diff --git ").unwrap_or("");
    match rest.rfind(" b/") {
        Some(pos) => {
            let from = rest[..pos].strip_prefix("a/").unwrap_or(&rest[..pos]);
            let to = &rest[pos + 3..];
            (Some(from.to_string()), Some(to.to_string()))
        }
        None => (None, None),
    }
}

/// Path from a `---`/`+++` marker line; `/dev/null` means the side is absent.
fn marker_path(raw: &str, prefix: &str) -> Option<String> {
    // Git appends a tab after paths containing spaces
    let raw = raw.split('\t').next().unwrap_or(raw);
    if raw == "/dev/null" {
        return None;
    }
    Some(raw.strip_prefix(prefix).unwrap_or(raw).to_string())
}

/// Parse a single hunk starting at its `@@` line.
fn parse_hunk(lines: &[&str], start: usize) -> Result<(Hunk, usize)> {
    let header = lines[start];
    let (old_start, old_lines, new_start, new_lines) =
        parse_hunk_header(header).ok_or_else(|| ParseError::MalformedHunkHeader {
            line: start + 1,
            header: header.to_string(),
        })?;

    let mut changes = Vec::new();
    let mut old_ln = old_start;
    let mut new_ln = new_start;
    let mut old_remaining = old_lines;
    let mut new_remaining = new_lines;
    let mut i = start + 1;

    while old_remaining > 0 || new_remaining > 0 {
        let Some(current) = lines.get(i) else {
            return Err(ParseError::TruncatedHunk { line: start + 1 });
        };
        let unexpected = || ParseError::UnexpectedLine {
            line: i + 1,
            content: current.to_string(),
        };

        match current.as_bytes().first() {
            Some(b'+') => {
                if new_remaining == 0 {
                    return Err(unexpected());
                }
                changes.push(Change::Add {
                    ln: new_ln,
                    content: current[1..].to_string(),
                });
                new_ln += 1;
                new_remaining -= 1;
            }
            Some(b'-') => {
                if old_remaining == 0 {
                    return Err(unexpected());
                }
                changes.push(Change::Del {
                    ln: old_ln,
                    content: current[1..].to_string(),
                });
                old_ln += 1;
                old_remaining -= 1;
            }
            // Some producers strip the lone space of an empty context line
            Some(b' ') | None => {
                if old_remaining == 0 || new_remaining == 0 {
                    return Err(unexpected());
                }
                changes.push(Change::Normal {
                    ln1: old_ln,
                    ln2: new_ln,
                    content: current.get(1..).unwrap_or("").to_string(),
                });
                old_ln += 1;
                new_ln += 1;
                old_remaining -= 1;
                new_remaining -= 1;
            }
            Some(b'\\') => {}
            Some(_) => return Err(unexpected()),
        }

        i += 1;
    }

    // "\ No newline at end of file" after the last body line
    while lines.get(i).is_some_and(|l| l.starts_with('\\')) {
        i += 1;
    }

    Ok((
        Hunk {
            old_start,
            old_lines,
            new_start,
            new_lines,
            changes,
        },
        i,
    ))
}

/// Parse `@@ -old_start[,old_count] +new_start[,new_count] @@ [context]`.
fn parse_hunk_header(line: &str) -> Option<(u32, u32, u32, u32)> {
    let header = line.strip_prefix("@@ ")?;
    let header = &header[..header.find(" @@")?];
    let mut parts = header.split(' ');

    let (old_start, old_count) = parse_range(parts.next()?.strip_prefix('-')?)?;
    let (new_start, new_count) = parse_range(parts.next()?.strip_prefix('+')?)?;

    if parts.next().is_some() {
        return None;
    }
    // Line numbers past the end of a range must still fit
    old_start.checked_add(old_count)?;
    new_start.checked_add(new_count)?;

    Some((old_start, old_count, new_start, new_count))
}

/// Parse a range like "start,count" or "start" (count defaults to 1).
fn parse_range(s: &str) -> Option<(u32, u32)> {
    match s.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((s.parse().ok()?, 1)),
    }
}
