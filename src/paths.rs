use std::env;
use std::path::PathBuf;

/// Expands `~` and a leading `~/` to `$HOME`. Other paths pass through
/// trimmed.
pub fn expand_tilde(path: &str) -> PathBuf {
    let trimmed = path.trim();
    let rest = match trimmed.strip_prefix('~') {
        Some("") => "",
        Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(trimmed),
    };
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => PathBuf::from(trimmed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_plain_paths_alone() {
        assert_eq!(expand_tilde(" /etc/lifai.jsonc "), PathBuf::from("/etc/lifai.jsonc"));
        assert_eq!(expand_tilde("~user/config"), PathBuf::from("~user/config"));
    }

    #[test]
    fn expands_home_prefix() {
        let Some(home) = env::var_os("HOME") else {
            return;
        };
        let home = PathBuf::from(home);
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(
            expand_tilde("~/.config/lifai-rs/config.jsonc"),
            home.join(".config/lifai-rs/config.jsonc")
        );
    }
}
