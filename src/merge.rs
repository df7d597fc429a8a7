//! Three-way text merge.
//!
//! Update merges a locally edited file (`mine`) with the new upstream copy
//! (`theirs`) against the old pristine copy (`base`). The merge itself is a
//! pluggable [`MergeTool`]: [`Diff3`] shells out to a diff3-compatible
//! program, [`LineMerge`] is a self-contained line-based implementation.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use tracing::debug;

use crate::config::MergeConfig;
use crate::error::{Error, Result};

/// Conflict marker opening the local side
pub const CONFLICT_MARKER_OURS: &str = "<<<<<<<";

/// Conflict marker separating the two sides
pub const CONFLICT_MARKER_SEP: &str = "=======";

/// Conflict marker closing the upstream side
pub const CONFLICT_MARKER_THEIRS: &str = ">>>>>>>";

/// Check if content contains conflict markers.
pub fn has_conflict_markers(content: &str) -> bool {
    content.contains(CONFLICT_MARKER_OURS)
        && content.contains(CONFLICT_MARKER_SEP)
        && content.contains(CONFLICT_MARKER_THEIRS)
}

/// Result of a three-way merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Every region was changed on at most one side.
    Clean,
    /// Output contains conflict markers.
    Conflict,
}

pub trait MergeTool {
    /// Merge `mine` and `theirs` relative to `base`, writing the result to `out`.
    fn merge(&self, mine: &Path, base: &Path, theirs: &Path, out: &Path) -> Result<MergeOutcome>;
}

/// Build the merge tool named in the configuration.
pub fn from_config(config: &MergeConfig) -> Arc<dyn MergeTool> {
    if config.tool == "builtin" {
        Arc::new(LineMerge)
    } else {
        Arc::new(Diff3::new(config.tool.clone()))
    }
}

/// External `diff3 -m -E`.
///
/// Exit status 0 is a clean merge, 1 a merge with conflicts; anything else
/// is reported as [`Error::ExtRuntime`].
#[derive(Debug, Clone)]
pub struct Diff3 {
    program: String,
}

impl Diff3 {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for Diff3 {
    fn default() -> Self {
        Self::new("diff3")
    }
}

impl MergeTool for Diff3 {
    fn merge(&self, mine: &Path, base: &Path, theirs: &Path, out: &Path) -> Result<MergeOutcome> {
        let output = Command::new(&self.program)
            .arg("-m")
            .arg("-E")
            .arg(mine)
            .arg(base)
            .arg(theirs)
            .output()?;

        let outcome = match output.status.code() {
            Some(0) => MergeOutcome::Clean,
            Some(1) => MergeOutcome::Conflict,
            status => {
                return Err(Error::ExtRuntime {
                    command: format!(
                        "{} -m -E {} {} {}",
                        self.program,
                        mine.display(),
                        base.display(),
                        theirs.display()
                    ),
                    status: status.unwrap_or(-1),
                })
            }
        };
        fs::write(out, &output.stdout)?;
        debug!(program = %self.program, ?outcome, "external merge finished");
        Ok(outcome)
    }
}

/// Line-based three-way merge without external processes.
///
/// Lines that match the base on both sides (by longest common subsequence)
/// anchor the merge; each region between anchors is taken from whichever
/// side changed it, or emitted with conflict markers when both did.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineMerge;

impl MergeTool for LineMerge {
    fn merge(&self, mine: &Path, base: &Path, theirs: &Path, out: &Path) -> Result<MergeOutcome> {
        let mine_data = fs::read(mine)?;
        let base_data = fs::read(base)?;
        let theirs_data = fs::read(theirs)?;

        let (merged, outcome) = merge_bytes(
            &mine_data,
            &base_data,
            &theirs_data,
            &label(mine),
            &label(theirs),
        );
        fs::write(out, merged)?;
        Ok(outcome)
    }
}

fn label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Merge in memory. Exposed for callers that already hold the content.
pub fn merge_bytes(
    mine: &[u8],
    base: &[u8],
    theirs: &[u8],
    mine_label: &str,
    theirs_label: &str,
) -> (Vec<u8>, MergeOutcome) {
    let mine = split_lines(mine);
    let base = split_lines(base);
    let theirs = split_lines(theirs);

    let to_mine = lcs_matches(&base, &mine);
    let to_theirs = lcs_matches(&base, &theirs);

    // Anchors: base lines kept by both sides, plus an end sentinel.
    let mut anchors: Vec<(usize, usize, usize)> = (0..base.len())
        .filter_map(|o| Some((o, to_mine[o]?, to_theirs[o]?)))
        .collect();
    anchors.push((base.len(), mine.len(), theirs.len()));

    let mut merged = Vec::new();
    let mut outcome = MergeOutcome::Clean;
    let (mut o, mut a, mut b) = (0, 0, 0);

    for (next_o, next_a, next_b) in anchors {
        let base_chunk = &base[o..next_o];
        let mine_chunk = &mine[a..next_a];
        let theirs_chunk = &theirs[b..next_b];

        if mine_chunk == base_chunk {
            extend(&mut merged, theirs_chunk);
        } else if theirs_chunk == base_chunk || mine_chunk == theirs_chunk {
            extend(&mut merged, mine_chunk);
        } else {
            outcome = MergeOutcome::Conflict;
            push_marker(&mut merged, CONFLICT_MARKER_OURS, Some(mine_label));
            extend_terminated(&mut merged, mine_chunk);
            push_marker(&mut merged, CONFLICT_MARKER_SEP, None);
            extend_terminated(&mut merged, theirs_chunk);
            push_marker(&mut merged, CONFLICT_MARKER_THEIRS, Some(theirs_label));
        }

        if next_o < base.len() {
            merged.extend_from_slice(base[next_o]);
        }
        o = next_o + 1;
        a = next_a + 1;
        b = next_b + 1;
    }

    (merged, outcome)
}

fn split_lines(data: &[u8]) -> Vec<&[u8]> {
    data.split_inclusive(|byte| *byte == b'\n').collect()
}

fn extend(out: &mut Vec<u8>, lines: &[&[u8]]) {
    for line in lines {
        out.extend_from_slice(line);
    }
}

fn extend_terminated(out: &mut Vec<u8>, lines: &[&[u8]]) {
    extend(out, lines);
    if !out.is_empty() && !out.ends_with(b"\n") {
        out.push(b'\n');
    }
}

fn push_marker(out: &mut Vec<u8>, marker: &str, label: Option<&str>) {
    if !out.is_empty() && !out.ends_with(b"\n") {
        out.push(b'\n');
    }
    out.extend_from_slice(marker.as_bytes());
    if let Some(label) = label {
        out.push(b' ');
        out.extend_from_slice(label.as_bytes());
    }
    out.push(b'\n');
}

/// For every line of `base`, the index of the line of `other` it is matched
/// to by a longest common subsequence, if any.
fn lcs_matches(base: &[&[u8]], other: &[&[u8]]) -> Vec<Option<usize>> {
    let mut matches = vec![None; base.len()];

    let prefix = base
        .iter()
        .zip(other.iter())
        .take_while(|(x, y)| x == y)
        .count();
    for (i, slot) in matches.iter_mut().enumerate().take(prefix) {
        *slot = Some(i);
    }

    let suffix = base[prefix..]
        .iter()
        .rev()
        .zip(other[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    for k in 0..suffix {
        matches[base.len() - 1 - k] = Some(other.len() - 1 - k);
    }

    let base_mid = &base[prefix..base.len() - suffix];
    let other_mid = &other[prefix..other.len() - suffix];
    let n = base_mid.len();
    let m = other_mid.len();
    if n == 0 || m == 0 {
        return matches;
    }

    // lengths[i][j] = LCS length of base_mid[i..] and other_mid[j..]
    let width = m + 1;
    let mut lengths = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lengths[i * width + j] = if base_mid[i] == other_mid[j] {
                lengths[(i + 1) * width + j + 1] + 1
            } else {
                lengths[(i + 1) * width + j].max(lengths[i * width + j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if base_mid[i] == other_mid[j] {
            matches[prefix + i] = Some(prefix + j);
            i += 1;
            j += 1;
        } else if lengths[(i + 1) * width + j] >= lengths[i * width + j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }

    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merge(mine: &str, base: &str, theirs: &str) -> (String, MergeOutcome) {
        let (bytes, outcome) =
            merge_bytes(mine.as_bytes(), base.as_bytes(), theirs.as_bytes(), "f.mine", "f.new");
        (String::from_utf8(bytes).expect("utf8"), outcome)
    }

    #[test]
    fn local_only_edit_wins() {
        let (out, outcome) = merge("a\nB\nc\n", "a\nb\nc\n", "a\nb\nc\n");
        assert_eq!(outcome, MergeOutcome::Clean);
        assert_eq!(out, "a\nB\nc\n");
    }

    #[test]
    fn upstream_only_edit_wins() {
        let (out, outcome) = merge("a\nb\nc\n", "a\nb\nc\n", "a\nb\nC\nd\n");
        assert_eq!(outcome, MergeOutcome::Clean);
        assert_eq!(out, "a\nb\nC\nd\n");
    }

    #[test]
    fn disjoint_edits_combine() {
        let (out, outcome) = merge("A\nb\nc\nd\n", "a\nb\nc\nd\n", "a\nb\nc\nD\n");
        assert_eq!(outcome, MergeOutcome::Clean);
        assert_eq!(out, "A\nb\nc\nD\n");
    }

    #[test]
    fn identical_edits_do_not_conflict() {
        let (out, outcome) = merge("a\nX\nc\n", "a\nb\nc\n", "a\nX\nc\n");
        assert_eq!(outcome, MergeOutcome::Clean);
        assert_eq!(out, "a\nX\nc\n");
    }

    #[test]
    fn overlapping_edits_conflict_with_markers() {
        let (out, outcome) = merge("a\nmine\nc\n", "a\nb\nc\n", "a\ntheirs\nc\n");
        assert_eq!(outcome, MergeOutcome::Conflict);
        assert_eq!(
            out,
            "a\n<<<<<<< f.mine\nmine\n=======\ntheirs\n>>>>>>> f.new\nc\n"
        );
        assert!(has_conflict_markers(&out));
    }

    #[test]
    fn missing_trailing_newline_keeps_markers_on_own_lines() {
        let (out, outcome) = merge("x", "", "y");
        assert_eq!(outcome, MergeOutcome::Conflict);
        assert_eq!(out, "<<<<<<< f.mine\nx\n=======\ny\n>>>>>>> f.new\n");
    }

    #[test]
    fn line_merge_reads_and_writes_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mine = dir.path().join("f.mine");
        let base = dir.path().join("base");
        let theirs = dir.path().join("f.new");
        let out = dir.path().join("f");
        fs::write(&mine, "1\n2\n3\n").unwrap();
        fs::write(&base, "1\n2\n").unwrap();
        fs::write(&theirs, "0\n1\n2\n").unwrap();

        let outcome = LineMerge.merge(&mine, &base, &theirs, &out).expect("merge");
        assert_eq!(outcome, MergeOutcome::Clean);
        assert_eq!(fs::read_to_string(&out).unwrap(), "0\n1\n2\n3\n");
    }

    #[cfg(unix)]
    #[test]
    fn diff3_unexpected_status_is_runtime_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("fake-diff3");
        fs::write(&script, "#!/bin/sh\nexit 2\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        for name in ["m", "b", "t"] {
            fs::write(dir.path().join(name), "x\n").unwrap();
        }

        let tool = Diff3::new(script.to_string_lossy().into_owned());
        let result = tool.merge(
            &dir.path().join("m"),
            &dir.path().join("b"),
            &dir.path().join("t"),
            &dir.path().join("out"),
        );
        assert!(matches!(result, Err(Error::ExtRuntime { status: 2, .. })));
    }
}
