//! # Maximization: Fase de Reduce
//!
//! Cada redutor recebe todas as contagens de **um** estado de origem, vindas
//! de todas as partições, e produz as novas distribuições daquele estado:
//!
//! $$P(t \mid s) = \frac{E[\#(s \to t)]}{\sum_{t'} E[\#(s \to t')]}$$
//!
//! calculado em log-space como `count - log_sum(counts)`, separadamente para
//! transições e emissões.
//!
//! Um tipo sem contagem alguma para a origem simplesmente não aparece na
//! saída: a origem perde aquela distribuição no modelo seguinte.
//!
//! A chave reservada [`RoundKey::LogLikelihood`] é reduzida por soma simples
//! dos parciais.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::Result;
use crate::expectation::{LikelihoodPartial, RoundKey, RoundValue};
use crate::logspace::log_add;
use crate::model::{normalize_log_weights, ModelParameter, ParameterCount, ParameterKind, StatePair};

/// Saída de um redutor.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutput {
    Parameters(Vec<ModelParameter>),
    Likelihood(LikelihoodPartial),
}

/// Novas distribuições de um estado de origem.
pub fn maximize(source: &str, counts: &[ParameterCount]) -> Vec<ModelParameter> {
    let mut by_kind: BTreeMap<ParameterKind, BTreeMap<String, f64>> = BTreeMap::new();
    for count in counts {
        by_kind
            .entry(count.kind)
            .or_default()
            .entry(count.target.clone())
            .and_modify(|c| *c = log_add(Some(*c), Some(count.log_count)).unwrap_or(*c))
            .or_insert(count.log_count);
    }

    let mut params = Vec::new();
    for (kind, mut targets) in by_kind {
        if !normalize_log_weights(&mut targets) {
            debug!(origem = source, tipo = kind.name(), "sem massa, distribuição omitida");
            continue;
        }
        params.extend(
            targets
                .into_iter()
                .map(|(target, lp)| ModelParameter::new(kind, StatePair::new(source, target), lp)),
        );
    }
    params
}

/// Redutor de uma rodada: despacha pela chave.
pub fn reduce(key: &RoundKey, values: &[RoundValue]) -> Result<RoundOutput> {
    match key {
        RoundKey::LogLikelihood => {
            let total = values
                .iter()
                .filter_map(|v| match v {
                    RoundValue::Likelihood(l) => Some(*l),
                    RoundValue::Count(_) => None,
                })
                .fold(LikelihoodPartial::default(), LikelihoodPartial::merge);
            Ok(RoundOutput::Likelihood(total))
        }
        RoundKey::Source(source) => {
            let counts: Vec<ParameterCount> = values
                .iter()
                .filter_map(|v| match v {
                    RoundValue::Count(c) => Some(c.clone()),
                    RoundValue::Likelihood(_) => None,
                })
                .collect();
            Ok(RoundOutput::Parameters(maximize(source, &counts)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(kind: ParameterKind, target: &str, p: f64) -> ParameterCount {
        ParameterCount {
            kind,
            target: target.into(),
            log_count: p.ln(),
        }
    }

    fn sum_of(params: &[ModelParameter], kind: ParameterKind) -> f64 {
        params
            .iter()
            .filter(|p| p.kind == kind)
            .map(|p| p.log_probability.exp())
            .sum()
    }

    #[test]
    fn test_each_kind_sums_to_one() {
        use ParameterKind::*;
        let params = maximize(
            "A",
            &[
                count(Transition, "A", 0.3),
                count(Transition, "B", 0.5),
                count(Transition, "A", 0.2),
                count(Emission, "x", 2.0),
                count(Emission, "y", 6.0),
            ],
        );
        assert!((sum_of(&params, Transition) - 1.0).abs() < 1e-9);
        assert!((sum_of(&params, Emission) - 1.0).abs() < 1e-9);

        let a_to_a = params
            .iter()
            .find(|p| p.kind == Transition && p.pair == StatePair::new("A", "A"))
            .unwrap();
        assert!((a_to_a.log_probability.exp() - 0.5).abs() < 1e-12);
        let y = params
            .iter()
            .find(|p| p.kind == Emission && p.pair.second == "y")
            .unwrap();
        assert!((y.log_probability.exp() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_kind_without_counts_is_dropped() {
        let params = maximize("#", &[count(ParameterKind::Transition, "A", 1.0)]);
        assert_eq!(params.len(), 1);
        assert!(params.iter().all(|p| p.kind == ParameterKind::Transition));
        assert!(params[0].log_probability.abs() < 1e-12);
    }

    #[test]
    fn test_tiny_counts_do_not_underflow() {
        let params = maximize(
            "A",
            &[
                ParameterCount {
                    kind: ParameterKind::Emission,
                    target: "x".into(),
                    log_count: -1000.0,
                },
                ParameterCount {
                    kind: ParameterKind::Emission,
                    target: "y".into(),
                    log_count: -1000.0 + 3f64.ln(),
                },
            ],
        );
        let x = params.iter().find(|p| p.pair.second == "x").unwrap();
        assert!((x.log_probability.exp() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_reduce_sums_likelihood_partials() {
        let values = [
            RoundValue::Likelihood(LikelihoodPartial {
                log_likelihood: -3.0,
                sequences: 2,
                skipped: 0,
            }),
            RoundValue::Likelihood(LikelihoodPartial {
                log_likelihood: -4.5,
                sequences: 1,
                skipped: 1,
            }),
        ];
        let out = reduce(&RoundKey::LogLikelihood, &values).unwrap();
        assert_eq!(
            out,
            RoundOutput::Likelihood(LikelihoodPartial {
                log_likelihood: -7.5,
                sequences: 3,
                skipped: 1,
            })
        );
    }

    #[test]
    fn test_reduce_dispatches_source_keys() {
        let values = [RoundValue::Count(count(ParameterKind::Emission, "x", 0.2))];
        match reduce(&RoundKey::Source("B".into()), &values).unwrap() {
            RoundOutput::Parameters(params) => {
                assert_eq!(params.len(), 1);
                assert_eq!(params[0].pair, StatePair::new("B", "x"));
            }
            other => panic!("saída inesperada: {other:?}"),
        }
    }
}
