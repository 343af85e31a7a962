use std::io::Write as _;

use camino::Utf8Path;
use eyre::WrapErr;
use regex::Regex;
use tracing::warn;

/// Name of the per-repository ignore file at the repo root.
pub const IGNORE_FILE: &str = ".stignore";

/// Compiled ignore patterns for one repository.
///
/// Each line of the ignore file is a glob: `*` matches within one path
/// segment, `**` crosses segments, `?` matches one character. A pattern
/// without a slash applies to the base name anywhere in the tree; a pattern
/// with a slash applies to the full relative path.
#[derive(Clone, Debug, Default)]
pub struct Patterns {
    lines: Vec<String>,
    matchers: Vec<Matcher>,
}

#[derive(Clone, Debug)]
struct Matcher {
    re: Regex,
    full_path: bool,
}

impl Patterns {
    /// Compiles patterns from raw lines. Blank lines are dropped; a line
    /// that fails to compile is logged and skipped rather than taking the
    /// whole file down.
    pub fn parse<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = Self::default();

        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() {
                continue;
            }

            match glob_to_regex(line) {
                Ok(re) => out.matchers.push(Matcher {
                    re,
                    full_path: line.contains('/'),
                }),
                Err(err) => {
                    warn!(pattern = line, %err, "Skipping unparseable ignore pattern");
                    continue;
                }
            }
            out.lines.push(line.to_owned());
        }

        out
    }

    /// Loads the ignore file at `path`. A missing file yields the empty
    /// pattern set.
    pub fn load(path: &Utf8Path) -> eyre::Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err).wrap_err_with(|| format!("loading {path}")),
        };

        Ok(Self::parse(content.lines()))
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    /// Whether `name` (a forward-slash relative path) is ignored.
    pub fn matches(&self, name: &str) -> bool {
        let base = name.rsplit('/').next().unwrap_or(name);

        self.matchers.iter().any(|m| {
            let target = if m.full_path { name } else { base };
            m.re.is_match(target)
        })
    }
}

/// Persists ignore lines atomically: temp file in the repo root, fsync,
/// rename over the ignore file.
pub fn save(dir: &Utf8Path, lines: &[String]) -> eyre::Result<()> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".flotilla.stignore-")
        .tempfile_in(dir)
        .wrap_err("creating ignore temp file")?;

    for line in lines {
        writeln!(tmp, "{line}").wrap_err("writing ignore temp file")?;
    }

    tmp.as_file().sync_all().wrap_err("syncing ignore file")?;
    let _file = tmp
        .persist(dir.join(IGNORE_FILE).as_std_path())
        .wrap_err("replacing ignore file")?;

    Ok(())
}

fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    let _star = chars.next();
                    re.push_str(".*");
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            c => {
                if "\\.+()|[]{}^$#&-~".contains(c) {
                    re.push('\\');
                }
                re.push(c);
            }
        }
    }

    re.push('$');
    Regex::new(&re)
}
