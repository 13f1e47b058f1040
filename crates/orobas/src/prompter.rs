//! Prompt templates for instruction tuning.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use vapula_core::{Error, Result};

/// An instruction-tuning prompt template.
///
/// `prompt_input` and `prompt_no_input` carry `{instruction}` / `{input}`
/// placeholders; `response_split` is the marker that separates the prompt
/// from the model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// Template used when the example has an input field.
    pub prompt_input: String,
    /// Template used when the example has no input field.
    pub prompt_no_input: String,
    /// Marker preceding the response portion of a rendered prompt.
    pub response_split: String,
}

impl PromptTemplate {
    /// Returns a built-in template by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an unknown template name.
    pub fn named(name: &str) -> Result<Self> {
        match name {
            "alpaca" => Ok(Self::alpaca()),
            "alpaca_short" => Ok(Self::alpaca_short()),
            other => Err(Error::invalid_config(format!(
                "unknown prompt template: {other}"
            ))),
        }
    }

    /// Loads a template from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn alpaca() -> Self {
        Self {
            prompt_input: "Below is an instruction that describes a task, paired with an input \
                           that provides further context. Write a response that appropriately \
                           completes the request.\n\n### Instruction:\n{instruction}\n\n\
                           ### Input:\n{input}\n\n### Response:\n"
                .to_string(),
            prompt_no_input: "Below is an instruction that describes a task. Write a response \
                              that appropriately completes the request.\n\n\
                              ### Instruction:\n{instruction}\n\n### Response:\n"
                .to_string(),
            response_split: "### Response:".to_string(),
        }
    }

    fn alpaca_short() -> Self {
        Self {
            prompt_input: "### Instruction:\n{instruction}\n\n### Input:\n{input}\n\n\
                           ### Response:\n"
                .to_string(),
            prompt_no_input: "### Instruction:\n{instruction}\n\n### Response:\n".to_string(),
            response_split: "### Response:".to_string(),
        }
    }
}

/// Renders instruction examples into training prompts.
#[derive(Debug, Clone)]
pub struct Prompter {
    template: PromptTemplate,
}

impl Prompter {
    /// Creates a prompter from a template.
    #[must_use]
    pub fn new(template: PromptTemplate) -> Self {
        Self { template }
    }

    /// Resolves a template spec: a path to a `.json` file, or a built-in
    /// template name.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown name or an unreadable file.
    pub fn from_spec(spec: &str) -> Result<Self> {
        let template = if spec.ends_with(".json") {
            PromptTemplate::from_file(spec)?
        } else {
            PromptTemplate::named(spec)?
        };
        Ok(Self::new(template))
    }

    /// Renders a prompt. An absent or empty `input` selects the no-input
    /// variant; a present `output` is appended after the response marker.
    #[must_use]
    pub fn generate_prompt(
        &self,
        instruction: &str,
        input: Option<&str>,
        output: Option<&str>,
    ) -> String {
        let rendered = match input.filter(|i| !i.is_empty()) {
            Some(input) => self
                .template
                .prompt_input
                .replace("{instruction}", instruction)
                .replace("{input}", input),
            None => self
                .template
                .prompt_no_input
                .replace("{instruction}", instruction),
        };
        match output {
            Some(output) => format!("{rendered}{output}"),
            None => rendered,
        }
    }

    /// Extracts the response portion of a rendered prompt, if the response
    /// marker is present.
    #[must_use]
    pub fn get_response<'a>(&self, text: &'a str) -> Option<&'a str> {
        text.split(&self.template.response_split)
            .nth(1)
            .map(str::trim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_selects_input_variant() {
        let p = Prompter::from_spec("alpaca_short").unwrap();
        let prompt = p.generate_prompt("Translate", Some("bonjour"), None);
        assert!(prompt.contains("### Input:\nbonjour"));
        assert!(prompt.ends_with("### Response:\n"));
    }

    #[test]
    fn empty_input_selects_no_input_variant() {
        let p = Prompter::from_spec("alpaca_short").unwrap();
        let with_none = p.generate_prompt("Translate", None, None);
        let with_empty = p.generate_prompt("Translate", Some(""), None);
        assert_eq!(with_none, with_empty);
        assert!(!with_none.contains("### Input:"));
    }

    #[test]
    fn output_is_appended() {
        let p = Prompter::from_spec("alpaca_short").unwrap();
        let prompt = p.generate_prompt("Say hi", None, Some("hi"));
        assert!(prompt.ends_with("### Response:\nhi"));
    }

    #[test]
    fn response_round_trips() {
        let p = Prompter::from_spec("alpaca").unwrap();
        let prompt = p.generate_prompt("Say hi", None, Some("hi there"));
        assert_eq!(p.get_response(&prompt), Some("hi there"));
        assert_eq!(p.get_response("no marker here"), None);
    }

    #[test]
    fn unknown_template_is_rejected() {
        assert!(Prompter::from_spec("unknown_template").is_err());
    }

    #[test]
    fn template_loads_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.json");
        std::fs::write(
            &path,
            r#"{"prompt_input":"Q: {instruction} [{input}]\nA: ",
                "prompt_no_input":"Q: {instruction}\nA: ",
                "response_split":"A:"}"#,
        )
        .unwrap();
        let p = Prompter::from_spec(path.to_str().unwrap()).unwrap();
        let prompt = p.generate_prompt("Why", None, Some("because"));
        assert_eq!(prompt, "Q: Why\nA: because");
        assert_eq!(p.get_response(&prompt), Some("because"));
    }
}
