use serde_json::Value;

use crate::error::HarvestError;
use crate::http::{CheckedResponse, ResilientClient};

/// One external entity returned for a business key, with the localized
/// description used for tag disambiguation (empty when absent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub entity: String,
    pub description: String,
}

pub trait QueryClient: Send + Sync {
    /// Looks up all candidates for a batch of business keys. The result is
    /// one (key, candidate) pair per binding; a key may appear any number of
    /// times, including zero.
    fn lookup_codes(&self, codes: &[String]) -> Result<Vec<(String, Candidate)>, HarvestError>;
}

impl<Q: QueryClient> QueryClient for &Q {
    fn lookup_codes(&self, codes: &[String]) -> Result<Vec<(String, Candidate)>, HarvestError> {
        (**self).lookup_codes(codes)
    }
}

#[derive(Clone)]
pub struct WikidataHttpClient {
    http: ResilientClient,
    endpoint: String,
    language: String,
}

impl WikidataHttpClient {
    pub fn new(http: ResilientClient, endpoint: String, language: String) -> Self {
        Self {
            http,
            endpoint,
            language,
        }
    }

    fn build_query(&self, codes: &[String]) -> String {
        let values = codes
            .iter()
            .filter(|code| !code.is_empty())
            .map(|code| format!("\"{}\"", code.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "SELECT ?item ?code ?desc WHERE {{\n  \
               VALUES ?code {{ {values} }}\n  \
               ?item wdt:P528 ?code .\n  \
               OPTIONAL {{\n    \
                 ?item schema:description ?desc .\n    \
                 FILTER (LANG(?desc) = \"{lang}\")\n  \
               }}\n\
             }}\n",
            lang = self.language
        )
    }
}

impl QueryClient for WikidataHttpClient {
    fn lookup_codes(&self, codes: &[String]) -> Result<Vec<(String, Candidate)>, HarvestError> {
        let query = self.build_query(codes);
        let response = self.http.post_form(
            &self.endpoint,
            &[("query", query.as_str())],
            Some("application/sparql-results+json"),
        )?;
        parse_bindings(&self.endpoint, &response)
    }
}

fn parse_bindings(
    url: &str,
    response: &CheckedResponse,
) -> Result<Vec<(String, Candidate)>, HarvestError> {
    let data: Value = response.json().map_err(|err| HarvestError::MalformedJson {
        url: url.to_string(),
        message: err.to_string(),
    })?;
    let bindings = data
        .get("results")
        .and_then(|value| value.get("bindings"))
        .and_then(|value| value.as_array())
        .map(|values| values.as_slice())
        .unwrap_or(&[]);

    let mut pairs = Vec::new();
    for binding in bindings {
        let code = binding_value(binding, "code");
        let item = binding_value(binding, "item");
        let description = binding_value(binding, "desc");
        if code.is_empty() || item.is_empty() {
            continue;
        }
        pairs.push((
            code.to_string(),
            Candidate {
                entity: entity_from_uri(item),
                description: description.to_string(),
            },
        ));
    }
    Ok(pairs)
}

fn binding_value<'a>(binding: &'a Value, name: &str) -> &'a str {
    binding
        .get(name)
        .and_then(|value| value.get("value"))
        .and_then(|value| value.as_str())
        .unwrap_or("")
}

fn entity_from_uri(uri: &str) -> String {
    uri.rsplit('/').next().unwrap_or(uri).to_string()
}
