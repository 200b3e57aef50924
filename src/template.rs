use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;
use std::sync::Arc;

use crate::config::{Settings, TemplateConfig};
use crate::error::{BadRequestKind, NegotiationError, Result};
use crate::model::Contract;
use crate::security::{Hash, HashAlgorithm};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Placeholder {
    name: String,
    span: Range<usize>,
}

#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    text: String,
    placeholders: Vec<Placeholder>,
    parameters: BTreeSet<String>,
    hashes: Vec<Hash>,
    preferred_hash: Hash,
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'
}

fn parse_placeholders(text: &str) -> Vec<Placeholder> {
    let mut placeholders = Vec::new();
    let mut rest = 0;
    while let Some(offset) = text[rest..].find('{') {
        let start = rest + offset;
        let inner = &text[start + 1..];
        let len = inner
            .char_indices()
            .find(|(_, c)| !is_identifier_char(*c))
            .map(|(i, _)| i)
            .unwrap_or(inner.len());
        if len > 0 && inner[len..].starts_with('}') {
            let end = start + 1 + len + 1;
            placeholders.push(Placeholder {
                name: inner[..len].to_string(),
                span: start..end,
            });
            rest = end;
        } else {
            rest = start + 1;
        }
    }
    placeholders
}

impl Template {
    pub fn new(
        name: impl Into<String>,
        text: impl Into<String>,
        accepted: &[HashAlgorithm],
    ) -> Result<Self> {
        let name = name.into();
        let text = text.into();
        if name.trim().is_empty() {
            return Err(NegotiationError::Config("Template name cannot be empty".to_string()));
        }

        let placeholders = parse_placeholders(&text);
        let parameters = placeholders.iter().map(|p| p.name.clone()).collect();
        let hashes = Hash::compute_all(accepted, text.as_bytes());
        let preferred = HashAlgorithm::preferred(accepted).ok_or_else(|| {
            NegotiationError::Config("No hash algorithm accepted".to_string())
        })?;
        let preferred_hash = Hash::compute(preferred, text.as_bytes());

        Ok(Self {
            name,
            text,
            placeholders,
            parameters,
            hashes,
            preferred_hash,
        })
    }

    pub fn from_config(config: &TemplateConfig, settings: &Settings) -> Result<Self> {
        let text = match (&config.text, &config.path) {
            (Some(text), None) => text.clone(),
            (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
                NegotiationError::Config(format!(
                    "Failed to read template '{}' from {}: {}",
                    config.name,
                    path.display(),
                    e
                ))
            })?,
            _ => {
                return Err(NegotiationError::Config(format!(
                    "Template '{}' needs exactly one of `text` or `path`",
                    config.name
                )))
            }
        };
        Self::new(config.name.clone(), text, &settings.accepted_hash_algorithms)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn parameters(&self) -> &BTreeSet<String> {
        &self.parameters
    }

    pub fn hashes(&self) -> &[Hash] {
        &self.hashes
    }

    pub fn preferred_hash(&self) -> &Hash {
        &self.preferred_hash
    }

    /// Reports every unknown key, missing parameter and blank value at once.
    pub fn validate(&self, arguments: &BTreeMap<String, String>) -> Result<()> {
        let mut problems = Vec::new();

        for key in arguments.keys() {
            if !self.parameters.contains(key) {
                problems.push(format!("unknown argument '{}'", key));
            }
        }
        for parameter in &self.parameters {
            match arguments.get(parameter) {
                None => problems.push(format!("missing argument '{}'", parameter)),
                Some(value) if value.trim().is_empty() => {
                    problems.push(format!("argument '{}' is blank", parameter))
                }
                Some(_) => {}
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(NegotiationError::ContractInvalid {
                template: self.name.clone(),
                problems,
            })
        }
    }

    /// Substitutes every placeholder with `{value}`.
    pub fn render(&self, arguments: &BTreeMap<String, String>) -> Result<String> {
        self.validate(arguments)?;

        let mut rendered = String::with_capacity(self.text.len());
        let mut cursor = 0;
        for placeholder in &self.placeholders {
            let value = arguments.get(&placeholder.name).ok_or_else(|| {
                NegotiationError::TemplateVanished(format!(
                    "argument '{}' of template '{}' disappeared after validation",
                    placeholder.name, self.name
                ))
            })?;
            rendered.push_str(&self.text[cursor..placeholder.span.start]);
            rendered.push('{');
            rendered.push_str(value);
            rendered.push('}');
            cursor = placeholder.span.end;
        }
        rendered.push_str(&self.text[cursor..]);
        Ok(rendered)
    }
}

/// Registry of templates, looked up by name or by any accepted hash.
#[derive(Debug, Default)]
pub struct Templates {
    by_name: HashMap<String, Arc<Template>>,
    by_hash: HashMap<Hash, Arc<Template>>,
}

impl Templates {
    pub fn new(templates: impl IntoIterator<Item = Template>) -> Result<Self> {
        let mut by_name = HashMap::new();
        let mut by_hash = HashMap::new();

        for template in templates {
            let template = Arc::new(template);
            if by_name
                .insert(template.name.clone(), template.clone())
                .is_some()
            {
                return Err(NegotiationError::Ambiguous(format!(
                    "template name '{}' is used twice",
                    template.name
                )));
            }
            for hash in &template.hashes {
                if let Some(existing) = by_hash.insert(hash.clone(), template.clone()) {
                    return Err(NegotiationError::Ambiguous(format!(
                        "templates '{}' and '{}' share hash {}",
                        existing.name, template.name, hash
                    )));
                }
            }
        }

        Ok(Self { by_name, by_hash })
    }

    pub fn get_by_name(&self, name: &str) -> Result<Arc<Template>> {
        self.by_name.get(name).cloned().ok_or_else(|| {
            NegotiationError::bad_request(
                BadRequestKind::UnknownTemplate,
                format!("no template named '{}'", name),
            )
        })
    }

    pub fn get_by_hash(&self, hash: &Hash) -> Result<Arc<Template>> {
        self.by_hash.get(hash).cloned().ok_or_else(|| {
            NegotiationError::bad_request(
                BadRequestKind::UnknownTemplate,
                format!("no template with hash {}", hash),
            )
        })
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Template>> {
        self.by_name.values()
    }

    /// Resolves the contract's template and validates its arguments.
    pub fn validate(&self, contract: &Contract) -> Result<Arc<Template>> {
        let template = self.get_by_hash(&contract.template_hash)?;
        template.validate(&contract.arguments)?;
        Ok(template)
    }

    pub fn render(&self, contract: &Contract) -> Result<String> {
        self.get_by_hash(&contract.template_hash)?
            .render(&contract.arguments)
    }
}
