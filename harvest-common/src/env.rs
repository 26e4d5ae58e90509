//! Small `FromStr` newtypes so `envconfig` can validate duration and
//! non-empty-string environment variables at startup instead of deep inside
//! business logic.

use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "value is not a valid number of milliseconds")
    }
}
impl std::error::Error for ParseEnvMsDurationError {}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;
        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl std::fmt::Display for StringIsEmptyError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "string must not be empty")
    }
}
impl std::error::Error for StringIsEmptyError {}

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_milliseconds() {
        let d = EnvMsDuration::from_str("1500").unwrap();
        assert_eq!(d.0, Duration::from_millis(1500));
    }

    #[test]
    fn rejects_empty_string() {
        assert!(NonEmptyString::from_str("").is_err());
        assert_eq!(NonEmptyString::from_str("x").unwrap().as_str(), "x");
    }
}
