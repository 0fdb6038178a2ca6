//! # Configuração do Treinamento
//!
//! Parâmetros de invocação do controlador. Podem vir de flags de linha de
//! comando (no binário) ou de um arquivo JSON:
//!
//! ```json
//! {
//!   "job_name": "pos-tagging",
//!   "corpus": "corpus",
//!   "output": "out",
//!   "transitions": "topology/transitions.txt",
//!   "emissions": "topology/emissions.txt",
//!   "epsilon": 0.001,
//!   "max_iterations": 50
//! }
//! ```
//!
//! Campos ausentes assumem os valores de [`EmConfig::default`]. Todos os
//! caminhos são relativos ao armazenamento (`storage_root`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EmError, Result};
use crate::substrate::{join, DEFAULT_RETRY_DELAY};

/// Nome do arquivo de parâmetros dentro de `<output>/<k>/`.
pub const MODEL_FILE: &str = "em_model_params.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmConfig {
    pub job_name: String,
    /// Raiz do armazenamento local (usada apenas pelo binário).
    pub storage_root: String,
    /// Arquivo ou diretório do corpus.
    pub corpus: String,
    pub output: String,
    pub transitions: String,
    pub emissions: String,
    /// Limiar de convergência sobre $L(k) - L(k-1)$.
    pub epsilon: f64,
    /// Limite de iterações; negativo = sem limite.
    pub max_iterations: i64,
    /// Semente do gerador do Model(0).
    pub seed: u64,
    /// Largura do pool de workers; 0 = número de CPUs.
    pub workers: usize,
    pub lines_per_partition: usize,
    /// Tentativas por tarefa antes de desistir.
    pub max_attempts: u32,
    /// Espera antes da primeira reexecução; dobra a cada nova falha.
    pub retry_delay_ms: u64,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            job_name: "hmm-em".to_string(),
            storage_root: ".".to_string(),
            corpus: "corpus".to_string(),
            output: "out".to_string(),
            transitions: "transitions.txt".to_string(),
            emissions: "emissions.txt".to_string(),
            epsilon: 1e-3,
            max_iterations: 100,
            seed: 0,
            workers: 0,
            lines_per_partition: 1000,
            max_attempts: 3,
            retry_delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
        }
    }
}

impl EmConfig {
    /// Lê a configuração de um texto JSON e valida.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: EmConfig = serde_json::from_str(text)
            .map_err(|e| EmError::InvalidConfig(format!("JSON de configuração: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| EmError::storage(&path.display().to_string(), e))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("job_name", &self.job_name),
            ("corpus", &self.corpus),
            ("output", &self.output),
            ("transitions", &self.transitions),
            ("emissions", &self.emissions),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(EmError::InvalidConfig(format!("{name} não pode ser vazio")));
            }
        }
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(EmError::InvalidConfig(format!(
                "epsilon precisa ser finito e não negativo, recebido {}",
                self.epsilon
            )));
        }
        if self.lines_per_partition == 0 {
            return Err(EmError::InvalidConfig(
                "lines_per_partition precisa ser maior que zero".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(EmError::InvalidConfig(
                "max_attempts precisa ser pelo menos 1".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// `None` quando não há limite de iterações.
    pub fn iteration_limit(&self) -> Option<usize> {
        usize::try_from(self.max_iterations).ok()
    }

    /// `<output>/<k>/em_model_params.jsonl`
    pub fn model_path(&self, iteration: usize) -> String {
        join(&join(&self.output, &iteration.to_string()), MODEL_FILE)
    }

    /// `<output>/tagged/part-NNNNN`
    pub fn tagged_path(&self, partition: usize) -> String {
        join(&join(&self.output, "tagged"), &format!("part-{partition:05}"))
    }

    /// `<output>/model.txt`
    pub fn model_text_path(&self) -> String {
        join(&self.output, "model.txt")
    }
}
