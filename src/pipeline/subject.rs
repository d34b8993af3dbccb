//! Subject grammar: `<keyword> - <target>`.

use crate::error::RoutingError;

/// Separator between keyword and target name.
pub const SEPARATOR: &str = " - ";

/// A parsed routing subject. The keyword is informational only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingSubject<'a> {
    pub keyword: &'a str,
    pub target: &'a str,
}

/// Split on the first separator and trim both halves.
///
/// Fails if the separator is missing or either half is empty after trimming.
pub fn parse(subject: &str) -> Result<RoutingSubject<'_>, RoutingError> {
    let (keyword, target) = subject
        .split_once(SEPARATOR)
        .ok_or_else(|| RoutingError::SubjectFormat(format!("missing '{SEPARATOR}' separator")))?;

    let keyword = keyword.trim();
    let target = target.trim();
    if keyword.is_empty() {
        return Err(RoutingError::SubjectFormat("empty keyword".into()));
    }
    if target.is_empty() {
        return Err(RoutingError::SubjectFormat("empty target name".into()));
    }
    Ok(RoutingSubject { keyword, target })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keyword_and_target() {
        let parsed = parse("报警 - 张三").unwrap();
        assert_eq!(parsed.keyword, "报警");
        assert_eq!(parsed.target, "张三");
    }

    #[test]
    fn trims_surrounding_whitespace() {
        let parsed = parse(" 通知 - 财务部 ").unwrap();
        assert_eq!(parsed.keyword, "通知");
        assert_eq!(parsed.target, "财务部");
    }

    #[test]
    fn rejects_malformed_subjects() {
        for subject in ["报警张三", "", "报警 - ", " - 张三", "报警-张三", "   -   "] {
            let err = parse(subject).unwrap_err();
            assert!(
                matches!(err, RoutingError::SubjectFormat(_)),
                "{subject:?} should not parse"
            );
        }
    }

    #[test]
    fn splits_on_first_separator_only() {
        let parsed = parse("disk - storage - eu").unwrap();
        assert_eq!(parsed.keyword, "disk");
        assert_eq!(parsed.target, "storage - eu");
    }
}
