//! Output formatting for command results
//!
//! Text is for people at a terminal; JSON is for release pipelines.

use std::str::FromStr;

use serde::Serialize;

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown output format: {s}")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// JSON envelope shared by every command.
#[derive(Debug, Serialize)]
pub struct JsonResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub command: &'static str,
}

impl<T: Serialize> JsonResponse<T> {
    pub fn success(command: &'static str, data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            command,
        }
    }
}

impl JsonResponse<()> {
    pub fn error(command: &'static str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            command,
        }
    }
}

/// Something a command can print in either format.
pub trait Report: Serialize {
    fn to_text(&self) -> String;
}

/// Print a successful result.
pub fn print_success<T: Report>(format: OutputFormat, command: &'static str, report: &T) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => println!("{}", report.to_text()),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&JsonResponse::success(command, report))?)
        }
    }
    Ok(())
}

/// Print a failure. Text goes to stderr, JSON to stdout.
pub fn print_failure(format: OutputFormat, command: &'static str, message: &str) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => eprintln!("Error: {message}"),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&JsonResponse::error(command, message))?)
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_parse() {
        assert_eq!("text".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("table".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_error_envelope_omits_data() {
        let json = serde_json::to_value(JsonResponse::error("verify", "bad signature")).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "bad signature");
        assert_eq!(json["command"], "verify");
        assert!(json.get("data").is_none());
    }
}
