//! Parsers for git plumbing output.

use chrono::{TimeZone, Utc};

use crate::types::{Commit, FileStatus, FileStatusCode, Submodule, SubmoduleStatus};

/// Record separator used in `--pretty` format strings.
pub const LOG_RECORD_SEP: char = '\u{1e}';
/// Field separator used in `--pretty` format strings.
pub const LOG_FIELD_SEP: char = '\u{1f}';

/// Pretty format producing one record per commit:
/// `hash␟author␟email␟epoch␟subject␞`.
pub const LOG_FORMAT: &str = "%H%x1f%an%x1f%ae%x1f%at%x1f%s%x1e";

/// Parsed `--porcelain=v1 -b` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchHeader {
    /// Current branch name (or short hash when detached).
    pub branch: String,
    /// Commits ahead of upstream.
    pub ahead: u32,
    /// Commits behind upstream.
    pub behind: u32,
    /// Whether an upstream is configured.
    pub has_upstream: bool,
}

/// Parse the `## ...` header line of `git status --porcelain=v1 -b`.
#[must_use]
pub fn parse_branch_header(line: &str) -> BranchHeader {
    let mut header = BranchHeader::default();
    let Some(rest) = line.strip_prefix("## ") else {
        return header;
    };

    // Forms: "main", "main...origin/main", "main...origin/main [ahead 2]",
    // "main...origin/main [ahead 1, behind 3]", "HEAD (no branch)".
    let (branch_part, tracking) = match rest.split_once("...") {
        Some((b, t)) => (b, Some(t)),
        None => (rest, None),
    };
    header.branch = branch_part.trim().to_string();

    if let Some(tracking) = tracking {
        header.has_upstream = true;
        if let Some(start) = tracking.find('[') {
            let inside = tracking[start + 1..].trim_end_matches(']');
            for part in inside.split(',') {
                let part = part.trim();
                if let Some(n) = part.strip_prefix("ahead ") {
                    header.ahead = n.parse().unwrap_or(0);
                } else if let Some(n) = part.strip_prefix("behind ") {
                    header.behind = n.parse().unwrap_or(0);
                }
            }
        }
    }
    header
}

/// Parse porcelain v1 status body lines into file statuses.
///
/// The header line (if present) is skipped; rename entries keep the new
/// path. The staged flag comes from the index column.
#[must_use]
pub fn parse_porcelain_status(output: &str) -> Vec<FileStatus> {
    let mut files = Vec::new();
    for line in output.lines() {
        if line.starts_with("##") || line.len() < 4 {
            continue;
        }
        let (index, worktree) = {
            let mut chars = line.chars();
            let x = chars.next().unwrap_or(' ');
            let y = chars.next().unwrap_or(' ');
            (x, y)
        };
        let raw_path = line[3..].trim();
        // Rename entries read "R  old -> new"; report the new path.
        let path = raw_path
            .split_once(" -> ")
            .map_or(raw_path, |(_, new)| new)
            .trim_matches('"')
            .to_string();

        let status = classify(index, worktree);
        let staged = index != ' ' && index != '?';

        files.push(FileStatus {
            path,
            status,
            staged,
        });
    }
    files
}

fn classify(index: char, worktree: char) -> FileStatusCode {
    if index == '?' || worktree == '?' {
        return FileStatusCode::Untracked;
    }
    if index == 'U' || worktree == 'U' || (index == 'A' && worktree == 'A') || (index == 'D' && worktree == 'D') {
        return FileStatusCode::Unmerged;
    }
    // The index column wins; fall back to the worktree column.
    let code = if index == ' ' { worktree } else { index };
    match code {
        'A' => FileStatusCode::Added,
        'D' => FileStatusCode::Deleted,
        'R' => FileStatusCode::Renamed,
        _ => FileStatusCode::Modified,
    }
}

/// Parse `git log --pretty=<LOG_FORMAT>` output.
#[must_use]
pub fn parse_log(output: &str) -> Vec<Commit> {
    output
        .split(LOG_RECORD_SEP)
        .filter_map(|record| {
            let record = record.trim();
            if record.is_empty() {
                return None;
            }
            let fields: Vec<&str> = record.split(LOG_FIELD_SEP).collect();
            let [hash, author, email, epoch, subject] = fields.as_slice() else {
                return None;
            };
            let timestamp = epoch
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())?;
            Some(Commit::new(
                hash.trim(),
                *author,
                *email,
                *subject,
                timestamp,
            ))
        })
        .collect()
}

/// Sum additions/deletions from `git diff --numstat` output.
///
/// Binary files report `-` in both columns and contribute nothing.
#[must_use]
pub fn parse_numstat(output: &str) -> (u64, u64) {
    let mut additions = 0;
    let mut deletions = 0;
    for line in output.lines() {
        let mut parts = line.split_whitespace();
        let (Some(a), Some(d)) = (parts.next(), parts.next()) else {
            continue;
        };
        additions += a.parse::<u64>().unwrap_or(0);
        deletions += d.parse::<u64>().unwrap_or(0);
    }
    (additions, deletions)
}

/// Parse `git submodule status` output.
///
/// Each line reads `<flag><sha> <path> (<ref>)` where the flag is `-`
/// (uninitialized), `+` (checked-out commit differs), `U` (conflicts),
/// or a space (in sync).
#[must_use]
pub fn parse_submodule_status(output: &str) -> Vec<(String, String, SubmoduleStatus, bool)> {
    let mut entries = Vec::new();
    for line in output.lines() {
        if line.len() < 2 {
            continue;
        }
        let flag = line.chars().next().unwrap_or(' ');
        let rest = &line[1..];
        let mut parts = rest.split_whitespace();
        let (Some(sha), Some(path)) = (parts.next(), parts.next()) else {
            continue;
        };

        let initialized = flag != '-';
        let status = SubmoduleStatus {
            ahead:         flag == '+',
            behind:        false,
            has_conflicts: flag == 'U',
            is_up_to_date: flag == ' ',
        };
        entries.push((path.to_string(), sha.to_string(), status, initialized));
    }
    entries
}

/// Merge `.gitmodules` config entries with `submodule status` entries.
///
/// `config_entries` maps submodule name to `(path, url)` as read from
/// `git config -f .gitmodules --get-regexp submodule\..*\.(path|url)`.
#[must_use]
pub fn assemble_submodules(
    config_output: &str,
    status_entries: &[(String, String, SubmoduleStatus, bool)],
) -> Vec<Submodule> {
    // Lines read: `submodule.<name>.path <value>` / `submodule.<name>.url <value>`.
    let mut by_name: Vec<(String, Option<String>, Option<String>)> = Vec::new();

    for line in config_output.lines() {
        let Some((key, value)) = line.split_once(' ') else {
            continue;
        };
        let Some(rest) = key.strip_prefix("submodule.") else {
            continue;
        };
        let Some((name, attr)) = rest.rsplit_once('.') else {
            continue;
        };
        let entry = match by_name.iter_mut().find(|(n, _, _)| n == name) {
            Some(entry) => entry,
            None => {
                by_name.push((name.to_string(), None, None));
                by_name.last_mut().unwrap()
            }
        };
        match attr {
            "path" => entry.1 = Some(value.to_string()),
            "url" => entry.2 = Some(value.to_string()),
            _ => {}
        }
    }

    by_name
        .into_iter()
        .filter_map(|(name, path, url)| {
            let path = path?;
            let (pinned, status, initialized) = status_entries
                .iter()
                .find(|(p, _, _, _)| *p == path)
                .map_or_else(
                    || (String::new(), SubmoduleStatus::default(), false),
                    |(_, sha, status, init)| (sha.clone(), *status, *init),
                );
            Some(Submodule {
                name,
                path,
                url: url.unwrap_or_default(),
                pinned_commit: pinned,
                initialized,
                status,
            })
        })
        .collect()
}

/// Bound a unified diff at `max_bytes` per file section, appending a
/// truncation marker to oversized sections.
#[must_use]
pub fn bound_diff(diff: &str, max_bytes: usize) -> String {
    if diff.is_empty() {
        return String::new();
    }

    let mut bounded = String::with_capacity(diff.len().min(max_bytes * 4));
    let mut first = true;
    for section in split_diff_sections(diff) {
        if !first {
            bounded.push('\n');
        }
        first = false;
        if section.len() > max_bytes {
            // Cut on a character boundary at or below the limit.
            let mut cut = max_bytes;
            while cut > 0 && !section.is_char_boundary(cut) {
                cut -= 1;
            }
            bounded.push_str(&section[..cut]);
            bounded.push_str("\n... [diff truncated]");
        } else {
            bounded.push_str(section);
        }
    }
    bounded
}

fn split_diff_sections(diff: &str) -> Vec<&str> {
    let mut sections = Vec::new();
    let mut start = 0;
    for (idx, _) in diff.match_indices("\ndiff --git ") {
        sections.push(&diff[start..idx]);
        start = idx + 1;
    }
    sections.push(&diff[start..]);
    sections
}
