//! Journal naming: name validation and the filename grammar.
//!
//! A journal named `NAME` in directory `DIR` consists of:
//!
//! - `DIR/NAME.pchkp` — the consistent checkpoint
//! - `DIR/NAME.pchkp.taking` — a checkpoint currently being taken
//! - `DIR/NAME.segments` — optional symlink to the segments directory
//! - `SEGDIR/NAME.<id>.pseg` — segment files, `<id>` a decimal u64
//!
//! Journal names are more restrictive than regular file names:
//! - only ASCII letters, digits, and `_ @ + = ~ . , ( ) [ ] { } -`
//! - no whitespace, no slashes
//! - length 1..=[`MAX_NAME_LEN`]

use std::path::Path;

/// Maximum journal name length, in bytes.
pub const MAX_NAME_LEN: usize = 64;

/// Maximum filename extension length, including the leading dot.
pub const MAX_EXT_LEN: usize = 10;

/// Maximum decimal digits in a segment id.
pub const MAX_ID_LEN: usize = 20;

/// Checkpoint file extension.
pub const EXT_CHECKPOINT: &str = ".pchkp";

/// Segment file extension.
pub const EXT_SEGMENT: &str = ".pseg";

/// Extension of the symlink to the segments directory.
pub const EXT_SEGDIR: &str = ".segments";

/// Second extension of a checkpoint that is currently being taken.
pub const EXT_TAKING: &str = ".taking";

/// What kind of journal object a filename denotes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilenameKind {
    Unknown,
    Checkpoint,
    SegmentDir,
    Segment,
}

/// A filename recognized as a journal component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParsedFilename<'a> {
    /// The journal name the file belongs to.
    pub name: &'a str,
    /// What the file is.
    pub kind: FilenameKind,
    /// The segment id, for segment files.
    pub id: Option<u64>,
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '_' | '@' | '+' | '=' | '~' | '.' | ',' | '(' | ')' | '[' | ']' | '{' | '}' | '-'
        )
}

/// Whether `name` is a valid journal name (without any path).
///
/// # Examples
///
/// ```
/// use jrnl_format::names::is_valid_name;
///
/// assert!(is_valid_name("bar"));
/// assert!(is_valid_name("foobar.today"));
/// assert!(!is_valid_name(""));
/// assert!(!is_valid_name("a/b"));
/// assert!(!is_valid_name("no whitespace"));
/// ```
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_NAME_LEN && name.chars().all(is_name_char)
}

/// Extract the journal name from a journal path.
///
/// Returns `None` when the final path component is not a valid journal name.
pub fn name_from_path(path: &Path) -> Option<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| is_valid_name(n))
}

/// A canonical decimal u64: digits only, no redundant leading zeros.
fn parse_canonical_id(digits: &str) -> Option<u64> {
    if digits.is_empty()
        || digits.len() > MAX_ID_LEN
        || !digits.bytes().all(|b| b.is_ascii_digit())
        || (digits.len() > 1 && digits.starts_with('0'))
    {
        return None;
    }
    digits.parse().ok()
}

/// Recognize a filename as a journal component and split it into its parts.
///
/// Returns `None` for anything that is not a checkpoint, segment, or
/// segments-directory filename.
///
/// # Examples
///
/// ```
/// use jrnl_format::names::{parse_filename, FilenameKind};
///
/// let parsed = parse_filename("bar.7.pseg").unwrap();
/// assert_eq!(parsed.name, "bar");
/// assert_eq!(parsed.kind, FilenameKind::Segment);
/// assert_eq!(parsed.id, Some(7));
///
/// assert!(parse_filename("bar.pchkp.taking").is_none());
/// assert!(parse_filename("bar.txt").is_none());
/// ```
pub fn parse_filename(filename: &str) -> Option<ParsedFilename<'_>> {
    if let Some(name) = filename.strip_suffix(EXT_SEGDIR) {
        return is_valid_name(name).then_some(ParsedFilename {
            name,
            kind: FilenameKind::SegmentDir,
            id: None,
        });
    }
    if let Some(name) = filename.strip_suffix(EXT_CHECKPOINT) {
        return is_valid_name(name).then_some(ParsedFilename {
            name,
            kind: FilenameKind::Checkpoint,
            id: None,
        });
    }
    if let Some(rest) = filename.strip_suffix(EXT_SEGMENT) {
        let (name, digits) = rest.rsplit_once('.')?;
        let id = parse_canonical_id(digits)?;
        return is_valid_name(name).then_some(ParsedFilename {
            name,
            kind: FilenameKind::Segment,
            id: Some(id),
        });
    }
    None
}

/// Build the filename of a journal component.
///
/// Returns `None` for an invalid name, for [`FilenameKind::Unknown`], or
/// for a segment without an id. The id is ignored for checkpoint and
/// segments-directory names.
pub fn build_filename(name: &str, kind: FilenameKind, id: Option<u64>) -> Option<String> {
    if !is_valid_name(name) {
        return None;
    }
    match kind {
        FilenameKind::Checkpoint => Some(checkpoint_filename(name)),
        FilenameKind::SegmentDir => Some(segdir_filename(name)),
        FilenameKind::Segment => id.map(|id| segment_filename(name, id)),
        FilenameKind::Unknown => None,
    }
}

/// `NAME.pchkp`
pub fn checkpoint_filename(name: &str) -> String {
    format!("{name}{EXT_CHECKPOINT}")
}

/// `NAME.<id>.pseg`
pub fn segment_filename(name: &str, id: u64) -> String {
    format!("{name}.{id}{EXT_SEGMENT}")
}

/// `NAME.segments`
pub fn segdir_filename(name: &str) -> String {
    format!("{name}{EXT_SEGDIR}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn valid_names() {
        assert!(is_valid_name("bar"));
        assert!(is_valid_name("foobar.today"));
        assert!(is_valid_name("a-b_c@d+e=f~g,h(i)[j]{k}"));
        assert!(is_valid_name(&"x".repeat(MAX_NAME_LEN)));
    }

    #[test]
    fn invalid_names() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name("tab\there"));
        assert!(!is_valid_name("a/b"));
        assert!(!is_valid_name("a\\b"));
        assert!(!is_valid_name("a*b"));
        assert!(!is_valid_name("a?b"));
        assert!(!is_valid_name(&"x".repeat(MAX_NAME_LEN + 1)));
    }

    #[test]
    fn name_from_journal_path() {
        assert_eq!(name_from_path(Path::new("/home/foo/bar")), Some("bar"));
        assert_eq!(name_from_path(Path::new("foobar")), Some("foobar"));
        assert_eq!(name_from_path(Path::new("../foobar.today")), Some("foobar.today"));
        assert_eq!(name_from_path(Path::new("/home/foo/")), Some("foo"));
        assert_eq!(name_from_path(Path::new("/home/foo/bad name")), None);
    }

    #[test]
    fn parse_checkpoint() {
        let parsed = parse_filename("bar.pchkp").unwrap();
        assert_eq!(parsed.name, "bar");
        assert_eq!(parsed.kind, FilenameKind::Checkpoint);
        assert_eq!(parsed.id, None);
    }

    #[test]
    fn parse_segment_with_dotted_name() {
        // The name may itself contain dots and digits; the id is the last
        // dot-separated run of digits before the extension.
        let parsed = parse_filename("a.b.7.pseg").unwrap();
        assert_eq!(parsed.name, "a.b");
        assert_eq!(parsed.id, Some(7));

        let parsed = parse_filename("v2.31.pseg").unwrap();
        assert_eq!(parsed.name, "v2");
        assert_eq!(parsed.id, Some(31));
    }

    #[test]
    fn parse_segdir() {
        let parsed = parse_filename("bar.segments").unwrap();
        assert_eq!(parsed.kind, FilenameKind::SegmentDir);
        assert_eq!(parsed.name, "bar");
    }

    #[test]
    fn parse_rejects_unknown() {
        assert!(parse_filename("bar").is_none());
        assert!(parse_filename("bar.txt").is_none());
        assert!(parse_filename("bar.pseg").is_none()); // segment without id
        assert!(parse_filename(".pchkp").is_none()); // empty name
        assert!(parse_filename("bar.pchkp.taking").is_none());
        assert!(parse_filename("bar.03.pseg").is_none()); // non-canonical id
        assert!(parse_filename("bar..pseg").is_none());
        assert!(parse_filename("bar.18446744073709551616.pseg").is_none()); // > u64::MAX
    }

    #[test]
    fn build_checkpoint_and_segdir_ignore_id() {
        assert_eq!(
            build_filename("bar", FilenameKind::Checkpoint, Some(3)).unwrap(),
            "bar.pchkp"
        );
        assert_eq!(
            build_filename("bar", FilenameKind::SegmentDir, None).unwrap(),
            "bar.segments"
        );
        assert!(build_filename("bar", FilenameKind::Segment, None).is_none());
        assert!(build_filename("bar", FilenameKind::Unknown, None).is_none());
        assert!(build_filename("bad name", FilenameKind::Checkpoint, None).is_none());
    }

    proptest! {
        #[test]
        fn segment_filename_inverse(name in "[A-Za-z0-9_@+=~,.-]{1,16}", id in any::<u64>()) {
            let filename = build_filename(&name, FilenameKind::Segment, Some(id)).unwrap();
            let parsed = parse_filename(&filename).unwrap();
            prop_assert_eq!(parsed.kind, FilenameKind::Segment);
            prop_assert_eq!(parsed.name, name.as_str());
            prop_assert_eq!(parsed.id, Some(id));
            prop_assert_eq!(
                build_filename(parsed.name, parsed.kind, parsed.id).unwrap(),
                filename
            );
        }

        #[test]
        fn checkpoint_filename_inverse(name in "[A-Za-z0-9_@+=~,.-]{1,16}") {
            let filename = build_filename(&name, FilenameKind::Checkpoint, None).unwrap();
            let parsed = parse_filename(&filename).unwrap();
            prop_assert_eq!(parsed.kind, FilenameKind::Checkpoint);
            prop_assert_eq!(parsed.name, name.as_str());
            prop_assert_eq!(
                build_filename(parsed.name, parsed.kind, parsed.id).unwrap(),
                filename
            );
        }
    }
}
