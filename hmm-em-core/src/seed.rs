//! # Seeding: Modelo Inicial a partir da Topologia
//!
//! O EM precisa de um ponto de partida. A topologia do HMM vem de dois arquivos
//! de texto, um par por linha:
//!
//! ```text
//! transitions.txt      emissions.txt
//! # A                  A x
//! # B                  A y
//! A A                  B x
//! A B                  B y
//! ```
//!
//! Cada par recebe um peso aleatório (tratado como log-probabilidade) e os pesos
//! são normalizados por origem, de modo que $\sum_t P(t \mid s) = 1$.
//!
//! O **estado inicial** é o `from` da primeira linha de transição. Ele é
//! devolvido explicitamente em [`Seed`] e carregado pelo controlador.
//!
//! O gerador é um `StdRng` com semente explícita: a mesma semente e os mesmos
//! arquivos produzem exatamente o mesmo Model(0).

use std::collections::{BTreeMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{EmError, Result};
use crate::model::{normalize_log_weights, Model, ModelParameter, ParameterKind, StatePair};

/// Resultado do seeding.
#[derive(Debug, Clone)]
pub struct Seed {
    pub model: Model,
    pub start_state: String,
}

/// Decodifica os bytes de um arquivo de topologia.
///
/// Bytes que não são UTF-8 falham com `TopologyParse`, apontando a linha.
pub fn topology_text<'a>(bytes: &'a [u8], location: &str) -> Result<&'a str> {
    std::str::from_utf8(bytes).map_err(|e| EmError::TopologyParse {
        location: location.to_string(),
        line: bytes[..e.valid_up_to()].iter().filter(|&&b| b == b'\n').count() + 1,
        reason: format!("UTF-8 inválido: {e}"),
    })
}

/// Lê um arquivo de topologia preservando a ordem das linhas.
///
/// Linhas em branco são ignoradas; qualquer outra linha precisa ter exatamente
/// dois tokens, e nenhum par pode se repetir.
pub fn parse_topology(text: &str, location: &str) -> Result<Vec<StatePair>> {
    let mut seen = HashSet::new();
    let mut pairs = Vec::new();

    for (i, line) in text.lines().enumerate() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        if tokens.len() != 2 {
            return Err(EmError::MalformedLine {
                location: location.to_string(),
                line: i + 1,
                found: tokens.len(),
            });
        }

        let pair = StatePair::new(tokens[0], tokens[1]);
        if !seen.insert(pair.clone()) {
            return Err(EmError::DuplicatePair {
                location: location.to_string(),
                line: i + 1,
                first: pair.first,
                second: pair.second,
            });
        }
        pairs.push(pair);
    }

    Ok(pairs)
}

/// Atribui pesos aleatórios aos pares e normaliza por origem.
fn randomize(
    kind: ParameterKind,
    pairs: Vec<StatePair>,
    rng: &mut StdRng,
) -> Vec<ModelParameter> {
    let mut by_source: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
    for pair in pairs {
        let weight: f64 = rng.gen();
        by_source
            .entry(pair.first)
            .or_default()
            .insert(pair.second, weight);
    }

    let mut params = Vec::new();
    for (source, mut targets) in by_source {
        normalize_log_weights(&mut targets);
        for (target, lp) in targets {
            params.push(ModelParameter::new(
                kind,
                StatePair::new(source.as_str(), target),
                lp,
            ));
        }
    }
    params
}

/// Constrói o Model(0).
///
/// Os dois arquivos são lidos e validados por completo antes de qualquer
/// sorteio; um erro aqui aborta a execução antes de qualquer trabalho distribuído.
pub fn seed_model(
    transitions: (&str, &str),
    emissions: (&str, &str),
    rng_seed: u64,
) -> Result<Seed> {
    let (trans_text, trans_location) = transitions;
    let (emis_text, emis_location) = emissions;

    let trans_pairs = parse_topology(trans_text, trans_location)?;
    let emis_pairs = parse_topology(emis_text, emis_location)?;

    let start_state = trans_pairs
        .first()
        .map(|p| p.first.clone())
        .ok_or_else(|| {
            EmError::InvalidConfig(format!("{trans_location}: nenhuma transição declarada"))
        })?;

    let mut rng = StdRng::seed_from_u64(rng_seed);
    let mut params = randomize(ParameterKind::Transition, trans_pairs, &mut rng);
    params.extend(randomize(ParameterKind::Emission, emis_pairs, &mut rng));

    Ok(Seed {
        model: Model::from_parameters(params),
        start_state,
    })
}
