//! Tracer option string parsing
//!
//! Recognized tokens:
//! - `-logdir <path>`: log directory (reserved; trace lines go to stderr)
//! - `-only_from_app`: only report library calls made by the application itself
//! - `-verbose <N>`: diagnostic verbosity for the tracer itself
//!
//! Anything else aborts startup. There are no silent defaults for bad input.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort session startup
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid option: {0}")]
    UnrecognizedOption(String),

    #[error("missing {what} after {option}")]
    MissingArgument { option: &'static str, what: &'static str },

    #[error("invalid -verbose number: {0:?}")]
    InvalidVerbose(String),

    #[error("unterminated quote in option string: {0}")]
    UnterminatedQuote(String),
}

/// Session-wide tracer options, immutable once the session is attached
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    /// Reserved log directory; not consumed by trace output
    pub logdir: Option<PathBuf>,
    /// Only report calls whose return address lies in the main executable
    pub only_from_app: bool,
    /// Diagnostic verbosity threshold
    pub verbose: u32,
}

impl Options {
    /// Parse a whitespace-separated option string such as
    /// `-only_from_app -verbose 2 -logdir "/tmp/my logs"`
    pub fn parse(opstr: &str) -> Result<Self, ConfigError> {
        Self::from_tokens(tokenize(opstr)?)
    }

    /// Parse an already tokenized option list
    pub fn from_tokens<I, S>(tokens: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = Options::default();
        let mut tokens = tokens.into_iter();

        while let Some(token) = tokens.next() {
            match token.as_ref() {
                "-logdir" => {
                    let path = tokens.next().ok_or(ConfigError::MissingArgument {
                        option: "-logdir",
                        what: "logdir path",
                    })?;
                    options.logdir = Some(PathBuf::from(path.as_ref()));
                }
                "-only_from_app" => options.only_from_app = true,
                "-verbose" => {
                    let value = tokens.next().ok_or(ConfigError::MissingArgument {
                        option: "-verbose",
                        what: "-verbose number",
                    })?;
                    let value = value.as_ref();
                    options.verbose = value
                        .parse::<u32>()
                        .map_err(|_| ConfigError::InvalidVerbose(value.to_string()))?;
                }
                other => {
                    tracing::error!("UNRECOGNIZED OPTION: \"{}\"", other);
                    return Err(ConfigError::UnrecognizedOption(other.to_string()));
                }
            }
        }

        Ok(options)
    }
}

/// Split an option string into tokens
///
/// Tokens are separated by ASCII whitespace. A token starting with `"` or
/// `'` extends to the matching closing quote and may contain whitespace.
pub fn tokenize(opstr: &str) -> Result<Vec<String>, ConfigError> {
    let mut tokens = Vec::new();
    let mut chars = opstr.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_ascii_whitespace()).is_some() {}

        let Some(first) = chars.next() else {
            break;
        };

        let mut token = String::new();
        if first == '"' || first == '\'' {
            let mut closed = false;
            for c in chars.by_ref() {
                if c == first {
                    closed = true;
                    break;
                }
                token.push(c);
            }
            if !closed {
                return Err(ConfigError::UnterminatedQuote(opstr.to_string()));
            }
        } else {
            token.push(first);
            while let Some(c) = chars.next_if(|c| !c.is_ascii_whitespace()) {
                token.push(c);
            }
        }
        tokens.push(token);
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_string_gives_defaults() {
        let options = Options::parse("").unwrap();
        assert_eq!(options, Options::default());
        assert!(!options.only_from_app);
        assert_eq!(options.verbose, 0);
        assert!(options.logdir.is_none());
    }

    #[test]
    fn test_all_options() {
        let options = Options::parse("-logdir /tmp/logs -only_from_app -verbose 2").unwrap();
        assert_eq!(options.logdir, Some(PathBuf::from("/tmp/logs")));
        assert!(options.only_from_app);
        assert_eq!(options.verbose, 2);
    }

    #[test]
    fn test_last_verbose_wins() {
        let options = Options::parse("-verbose 1 -verbose 3").unwrap();
        assert_eq!(options.verbose, 3);
    }

    #[test]
    fn test_unrecognized_option() {
        let err = Options::parse("-only_from_app -bogus").unwrap_err();
        assert_eq!(err, ConfigError::UnrecognizedOption("-bogus".to_string()));
    }

    #[test]
    fn test_non_numeric_verbose_is_fatal() {
        let err = Options::parse("-verbose high").unwrap_err();
        assert_eq!(err, ConfigError::InvalidVerbose("high".to_string()));
    }

    #[test]
    fn test_negative_verbose_is_fatal() {
        assert!(matches!(
            Options::parse("-verbose -1"),
            Err(ConfigError::InvalidVerbose(_))
        ));
    }

    #[test]
    fn test_missing_verbose_number() {
        let err = Options::parse("-verbose").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingArgument {
                option: "-verbose",
                ..
            }
        ));
        assert_eq!(err.to_string(), "missing -verbose number after -verbose");
    }

    #[test]
    fn test_missing_logdir_path() {
        let err = Options::parse("-logdir").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingArgument {
                option: "-logdir",
                ..
            }
        ));
    }

    #[test]
    fn test_quoted_logdir() {
        let options = Options::parse("-logdir \"/tmp/my logs\" -verbose 1").unwrap();
        assert_eq!(options.logdir, Some(PathBuf::from("/tmp/my logs")));
        assert_eq!(options.verbose, 1);
    }

    #[test]
    fn test_tokenize_whitespace_and_quotes() {
        let tokens = tokenize("  -a\t'b c'  \"\" d ").unwrap();
        assert_eq!(tokens, vec!["-a", "b c", "", "d"]);
    }

    #[test]
    fn test_tokenize_unterminated_quote() {
        assert!(matches!(
            tokenize("-logdir \"/tmp/oops"),
            Err(ConfigError::UnterminatedQuote(_))
        ));
    }

    #[test]
    fn test_from_tokens_accepts_owned_strings() {
        let tokens = vec!["-only_from_app".to_string()];
        assert!(Options::from_tokens(tokens).unwrap().only_from_app);
    }
}
