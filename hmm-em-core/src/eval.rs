//! # Avaliação de Tagging (many-to-one)
//!
//! Os estados aprendidos pelo EM não têm nome: `A` pode corresponder a
//! substantivo, `B` a verbo e assim por diante. A avaliação mapeia cada estado
//! para o rótulo de referência com que ele mais coocorre e mede a acurácia
//! desse mapeamento:
//!
//! ```text
//! decodificado:  (the,A) (dog,B) (barks,C)
//! referência:    (the,DET) (dog,NOUN) (barks,VERB)
//! ```
//!
//! Vários estados podem mapear para o mesmo rótulo. Empates de coocorrência
//! ficam com o rótulo de menor ordem lexicográfica.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{EmError, Result};
use crate::substrate::Storage;

/// Resultado da avaliação.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub total: usize,
    pub correct: usize,
    pub accuracy: f64,
    /// Estado aprendido → rótulo de referência.
    pub mapping: BTreeMap<String, String>,
}

/// Leitor de arquivos de tagging no formato `(obs,rótulo)`.
pub struct TaggingParser {
    pair: Regex,
}

impl TaggingParser {
    pub fn new() -> Result<Self> {
        let pair = Regex::new(r"^\((.*),(.*)\)$")
            .map_err(|e| EmError::InvalidConfig(format!("padrão de tagging: {e}")))?;
        Ok(Self { pair })
    }

    /// Rótulos de todos os tokens do texto, na ordem.
    pub fn parse(&self, text: &str, location: &str) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        for (i, line) in text.lines().enumerate() {
            for token in line.split_whitespace() {
                let caps = self.pair.captures(token).ok_or_else(|| EmError::TaggingParse {
                    location: location.to_string(),
                    line: i + 1,
                    token: token.to_string(),
                })?;
                tags.push(caps[2].to_string());
            }
        }
        Ok(tags)
    }

    /// Rótulos de todos os arquivos sob `location`, em ordem de caminho.
    pub fn parse_location<S: Storage + ?Sized>(&self, storage: &S, location: &str) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        for path in storage.list(location)? {
            let bytes = storage.read(&path)?;
            let text = std::str::from_utf8(&bytes).map_err(|e| invalid_utf8(&bytes, e, &path))?;
            tags.extend(self.parse(text, &path)?);
        }
        Ok(tags)
    }
}

/// `TaggingParse` apontando o token que contém o primeiro byte inválido.
fn invalid_utf8(bytes: &[u8], error: std::str::Utf8Error, location: &str) -> EmError {
    let at = error.valid_up_to();
    let start = bytes[..at]
        .iter()
        .rposition(u8::is_ascii_whitespace)
        .map_or(0, |i| i + 1);
    let end = bytes[at..]
        .iter()
        .position(u8::is_ascii_whitespace)
        .map_or(bytes.len(), |i| at + i);
    EmError::TaggingParse {
        location: location.to_string(),
        line: bytes[..at].iter().filter(|&&b| b == b'\n').count() + 1,
        token: String::from_utf8_lossy(&bytes[start..end]).into_owned(),
    }
}

/// Mapeamento many-to-one: cada estado para o rótulo mais frequente.
pub fn tag_mapping(predicted: &[String], gold: &[String]) -> BTreeMap<String, String> {
    let mut cooccurrence: BTreeMap<&str, BTreeMap<&str, usize>> = BTreeMap::new();
    for (p, g) in predicted.iter().zip(gold) {
        *cooccurrence
            .entry(p.as_str())
            .or_default()
            .entry(g.as_str())
            .or_default() += 1;
    }

    cooccurrence
        .into_iter()
        .filter_map(|(state, counts)| {
            let mut best: Option<(&str, usize)> = None;
            for (tag, n) in counts {
                if best.map_or(true, |(_, m)| n > m) {
                    best = Some((tag, n));
                }
            }
            best.map(|(tag, _)| (state.to_string(), tag.to_string()))
        })
        .collect()
}

/// Acurácia many-to-one dos rótulos decodificados contra a referência.
pub fn evaluate(predicted: &[String], gold: &[String]) -> Result<EvalReport> {
    if predicted.len() != gold.len() {
        return Err(EmError::LengthMismatch {
            predicted: predicted.len(),
            gold: gold.len(),
        });
    }

    let mapping = tag_mapping(predicted, gold);
    let correct = predicted
        .iter()
        .zip(gold)
        .filter(|(p, g)| mapping.get(p.as_str()) == Some(*g))
        .count();
    let total = predicted.len();
    let accuracy = if total == 0 {
        0.0
    } else {
        correct as f64 / total as f64
    };

    Ok(EvalReport {
        total,
        correct,
        accuracy,
        mapping,
    })
}
