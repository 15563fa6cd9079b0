//! Wildcard matching with `*` (any run) and `?` (any single character).

/// Returns true if `text` matches `pattern`.
#[must_use]
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_and_wildcards() {
        assert!(glob_match("sagemaker:CreateModel", "sagemaker:CreateModel"));
        assert!(glob_match("sagemaker:*", "sagemaker:UpdateEndpoint"));
        assert!(glob_match("arn:aws:s3:::bucket/output/*", "arn:aws:s3:::bucket/output/a/model.tar.gz"));
        assert!(glob_match("model-?", "model-1"));
        assert!(glob_match("*", ""));
    }

    #[test]
    fn test_non_matches() {
        assert!(!glob_match("sagemaker:Create*", "sagemaker:UpdateEndpoint"));
        assert!(!glob_match("arn:aws:s3:::bucket/output/*", "arn:aws:s3:::bucket/input/x"));
        assert!(!glob_match("model-?", "model-12"));
        assert!(!glob_match("", "x"));
    }

    #[test]
    fn test_multiple_stars_backtrack() {
        assert!(glob_match("*pipeline/*/execution/*", "arn:aws:sagemaker:r:1:pipeline/p/execution/e"));
        assert!(!glob_match("*a*b", "xxaxxc"));
    }
}
