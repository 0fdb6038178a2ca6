//! # Aritmética em Log-Space
//!
//! Probabilidades de sequências longas caem rapidamente abaixo do menor `f64`
//! representável. Por isso todo o treinamento trabalha com logaritmos naturais:
//!
//! $$ \log(A \cdot B) = \log(A) + \log(B) $$
//! $$ \log(A + B) = m + \log(e^{\log A - m} + e^{\log B - m}) $$
//!
//! A probabilidade zero não tem logaritmo finito; ela é representada pela
//! **ausência** de valor (`None`). Assim:
//! - `None` é o elemento neutro da soma ([`log_add`]);
//! - `None` é absorvente no produto ([`log_mul`]).

/// Log-probabilidade; `None` representa probabilidade 0.
pub type LogProb = Option<f64>;

/// `log(exp(a) + exp(b))`.
///
/// Os dois operandos são deslocados pelo mesmo valor `m` (o maior deles)
/// antes da exponenciação, de modo que o maior termo vira `e^0 = 1` e o
/// menor fica em `(0, 1]`. Sem esse deslocamento, `exp(-1000.0)` daria
/// `0.0` e a soma perderia toda a informação.
pub fn log_add(a: LogProb, b: LogProb) -> LogProb {
    match (a, b) {
        (None, None) => None,
        (Some(x), None) | (None, Some(x)) => Some(x),
        (Some(x), Some(y)) => {
            let shift = x.max(y);
            if shift == f64::NEG_INFINITY {
                return Some(f64::NEG_INFINITY);
            }
            Some(shift + ((x - shift).exp() + (y - shift).exp()).ln())
        }
    }
}

/// `a + b` em log-space, isto é, o produto das probabilidades.
pub fn log_mul(a: LogProb, b: LogProb) -> LogProb {
    Some(a? + b?)
}

/// Produto de vários fatores; `None` se qualquer um deles for `None`.
pub fn log_product<I: IntoIterator<Item = LogProb>>(factors: I) -> LogProb {
    factors.into_iter().try_fold(0.0, |acc, f| f.map(|v| acc + v))
}

/// Soma (log-sum-exp) de vários termos, na ordem em que chegam.
pub fn log_sum<I: IntoIterator<Item = LogProb>>(terms: I) -> LogProb {
    terms.into_iter().fold(None, log_add)
}

/// Máximo tratando `None` como −∞.
pub fn log_max(a: LogProb, b: LogProb) -> LogProb {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// `true` se `candidate` é estritamente maior que `best`.
pub(crate) fn beats(candidate: LogProb, best: LogProb) -> bool {
    match (candidate, best) {
        (Some(c), Some(b)) => c > b,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Volta para o espaço de probabilidade (0.0 para `None`).
pub fn to_prob(lp: LogProb) -> f64 {
    lp.map_or(0.0, f64::exp)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-12;

    fn close(a: LogProb, b: LogProb) -> bool {
        match (a, b) {
            (Some(x), Some(y)) => (x - y).abs() < TOL,
            (None, None) => true,
            _ => false,
        }
    }

    #[test]
    fn test_log_add_matches_direct_sum() {
        let a = 0.3f64.ln();
        let b = 0.5f64.ln();
        assert!(close(log_add(Some(a), Some(b)), Some(0.8f64.ln())));
    }

    #[test]
    fn test_log_add_commutative_and_associative() {
        let values = [-0.1, -3.5, -42.0, -700.0, 1.5, -1e-9];
        for &a in &values {
            for &b in &values {
                assert!(close(log_add(Some(a), Some(b)), log_add(Some(b), Some(a))));
                for &c in &values {
                    let left = log_add(log_add(Some(a), Some(b)), Some(c));
                    let right = log_add(Some(a), log_add(Some(b), Some(c)));
                    assert!((left.unwrap() - right.unwrap()).abs() < 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_missing_is_identity_for_add_and_absorbing_for_mul() {
        assert_eq!(log_add(Some(-2.0), None), Some(-2.0));
        assert_eq!(log_add(None, Some(-2.0)), Some(-2.0));
        assert_eq!(log_add(None, None), None);
        assert_eq!(log_mul(Some(-2.0), None), None);
        assert_eq!(log_mul(None, Some(-2.0)), None);
        assert_eq!(log_mul(Some(-2.0), Some(-3.0)), Some(-5.0));
    }

    #[test]
    fn test_log_add_survives_underflow() {
        // exp(-1000) é 0.0 em f64; o resultado ainda deve ser -1000 + ln 2
        let r = log_add(Some(-1000.0), Some(-1000.0)).unwrap();
        assert!((r - (-1000.0 + 2f64.ln())).abs() < TOL);

        let r = log_add(Some(-1000.0), Some(-2000.0)).unwrap();
        assert!((r - -1000.0).abs() < TOL);
    }

    #[test]
    fn test_product_and_sum_folds() {
        assert_eq!(log_product([Some(-1.0), Some(-2.0), Some(-0.5)]), Some(-3.5));
        assert_eq!(log_product([Some(-1.0), None]), None);
        assert_eq!(log_sum(Vec::<LogProb>::new()), None);
        let s = log_sum([Some(0.25f64.ln()), None, Some(0.25f64.ln())]).unwrap();
        assert!((s - 0.5f64.ln()).abs() < TOL);
    }

    #[test]
    fn test_log_max_and_beats() {
        assert_eq!(log_max(Some(-3.0), Some(-1.0)), Some(-1.0));
        assert_eq!(log_max(None, Some(-1.0)), Some(-1.0));
        assert_eq!(log_max(None, None), None);
        assert!(beats(Some(-1.0), None));
        assert!(!beats(None, Some(-1.0)));
        assert!(!beats(Some(-1.0), Some(-1.0)));
        assert_eq!(to_prob(None), 0.0);
    }
}
