//! # Controlador EM
//!
//! Orquestra o treinamento inteiro sobre um [`Storage`] e um [`JobRunner`]:
//!
//! ```text
//! SEEDING ──► ITERATING ──┬──► CONVERGED ──┐
//!                ▲   │    ├──► MAX_ITERS ──┼──► DECODING ──► DONE
//!                └───┘    └──► CANCELLED ──┘
//! ```
//!
//! 1. **Seeding**: lê os dois arquivos de topologia, sorteia o Model(0) e o
//!    grava em `<output>/0/`. Qualquer erro aqui aborta antes de qualquer
//!    escrita.
//! 2. **Iterating**: a rodada `k` lê o Model(k-1) do armazenamento, roda um job
//!    expectation/maximization e grava o Model(k) junto com $L(k)$ antes que a
//!    rodada `k+1` comece.
//! 3. **Convergência**: para quando $L(k) - L(k-1) < \varepsilon$. $L(0)$ não
//!    existe, então a primeira rodada nunca converge.
//! 4. **Decoding**: Viterbi sobre todo o corpus com o último modelo gravado.
//!
//! O EM nunca diminui a verossimilhança; uma queda maior que `1e-6` indica
//! problema numérico e é registrada como aviso.
//!
//! O cancelamento é cooperativo: a flag é consultada entre rodadas, então a
//! rodada em andamento termina e é gravada antes da decodificação.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::EmConfig;
use crate::corpus::{plan_partitions, CorpusPartition};
use crate::error::{EmError, Result};
use crate::expectation::{ExpectationTask, LikelihoodPartial};
use crate::maximization::{reduce, RoundOutput};
use crate::model::{Model, ModelSnapshot};
use crate::seed::{seed_model, topology_text, Seed};
use crate::substrate::{JobRunner, Storage};
use crate::viterbi::viterbi_decode;

/// Queda de verossimilhança tolerada antes do aviso de monotonicidade.
const MONOTONICITY_SLACK: f64 = 1e-6;

/// Fase atual do controlador.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Seeding,
    Iterating,
    Converged,
    MaxIters,
    Cancelled,
    Decoding,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "IDLE",
            Phase::Seeding => "SEEDING",
            Phase::Iterating => "ITERATING",
            Phase::Converged => "CONVERGED",
            Phase::MaxIters => "MAX_ITERS",
            Phase::Cancelled => "CANCELLED",
            Phase::Decoding => "DECODING",
            Phase::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Motivo do fim das iterações.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Converged,
    MaxIterations,
    Cancelled,
}

impl Termination {
    fn phase(self) -> Phase {
        match self {
            Termination::Converged => Phase::Converged,
            Termination::MaxIterations => Phase::MaxIters,
            Termination::Cancelled => Phase::Cancelled,
        }
    }
}

/// Resumo de uma rodada EM.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundSummary {
    pub iteration: usize,
    pub likelihood: LikelihoodPartial,
    pub parameters: usize,
    pub model_path: String,
}

/// Resultado da decodificação de uma partição, ainda não gravado.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DecodedPartition {
    path: String,
    text: String,
    decoded: usize,
    undecodable: usize,
}

/// Relatório final do treinamento.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub job_name: String,
    pub start_state: String,
    /// Rodadas EM concluídas (o Model(0) não conta).
    pub iterations: usize,
    /// $L(1), L(2), \ldots$
    pub log_likelihoods: Vec<f64>,
    pub termination: Termination,
    pub decoded: usize,
    pub undecodable: usize,
    /// Sequências ignoradas na última rodada por terem probabilidade zero.
    pub skipped: usize,
    pub final_model_path: String,
    pub model_text_path: String,
    pub tagged_paths: Vec<String>,
}

/// Controlador do treinamento.
pub struct EmController<S, R> {
    storage: S,
    runner: R,
    config: EmConfig,
    cancel: Arc<AtomicBool>,
    phase: Phase,
}

impl<S: Storage, R: JobRunner> EmController<S, R> {
    pub fn new(storage: S, runner: R, config: EmConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            storage,
            runner,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            phase: Phase::Idle,
        })
    }

    /// Flag de cancelamento compartilhável com outras threads.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &EmConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn enter(&mut self, phase: Phase) {
        info!(job = %self.config.job_name, de = %self.phase, para = %phase, "transição de fase");
        self.phase = phase;
    }

    fn write_snapshot(&self, iteration: usize, snapshot: &ModelSnapshot) -> Result<String> {
        let path = self.config.model_path(iteration);
        self.storage.write(&path, &snapshot.to_jsonl()?)?;
        Ok(path)
    }

    fn read_snapshot(&self, iteration: usize) -> Result<ModelSnapshot> {
        let path = self.config.model_path(iteration);
        ModelSnapshot::from_jsonl(&self.storage.read(&path)?, &path)
    }

    /// Lê e valida a topologia e sorteia o Model(0). Não grava nada.
    pub fn seed(&self) -> Result<Seed> {
        let transitions = self.storage.read(&self.config.transitions)?;
        let emissions = self.storage.read(&self.config.emissions)?;
        let seed = seed_model(
            (
                topology_text(&transitions, &self.config.transitions)?,
                self.config.transitions.as_str(),
            ),
            (
                topology_text(&emissions, &self.config.emissions)?,
                self.config.emissions.as_str(),
            ),
            self.config.seed,
        )?;
        info!(
            estado_inicial = %seed.start_state,
            estados = seed.model.states().len(),
            parametros = seed.model.len(),
            semente = self.config.seed,
            "Model(0) sorteado"
        );
        Ok(seed)
    }

    /// Uma rodada EM: Model(k-1) → Model(k), gravado junto com L(k).
    pub fn iterate(
        &self,
        iteration: usize,
        start_state: &str,
        partitions: &[CorpusPartition],
    ) -> Result<RoundSummary> {
        if iteration == 0 {
            return Err(EmError::InvalidConfig("a rodada 0 é o seeding".into()));
        }
        let previous = self.read_snapshot(iteration - 1)?.model;
        let task = ExpectationTask::new(&previous, start_state);
        let storage = &self.storage;

        let job = format!("{}-round-{iteration}", self.config.job_name);
        let outputs = self.runner.run(
            &job,
            partitions,
            |partition: &CorpusPartition| task.run(storage, partition),
            reduce,
        )?;

        let mut params = Vec::new();
        let mut likelihood = LikelihoodPartial::default();
        for output in outputs {
            match output {
                RoundOutput::Parameters(p) => params.extend(p),
                RoundOutput::Likelihood(l) => likelihood = likelihood.merge(l),
            }
        }

        if likelihood.sequences == 0 {
            return Err(EmError::InvalidConfig(format!(
                "{}: nenhuma sequência do corpus tem probabilidade positiva ({} ignoradas)",
                self.config.corpus, likelihood.skipped
            )));
        }

        let model = Model::from_parameters(params);
        let snapshot = ModelSnapshot {
            model,
            log_likelihood: Some(likelihood.log_likelihood),
        };
        let model_path = self.write_snapshot(iteration, &snapshot)?;

        Ok(RoundSummary {
            iteration,
            likelihood,
            parameters: snapshot.model.len(),
            model_path,
        })
    }

    fn decode_partition(
        &self,
        model: &Model,
        start_state: &str,
        partition: &CorpusPartition,
    ) -> Result<DecodedPartition> {
        let mut out = String::new();
        let mut decoded = 0;
        let mut undecodable = 0;

        for numbered in partition.load(&self.storage)? {
            match viterbi_decode(model, start_state, &numbered.sequence) {
                Ok(result) => {
                    out.push_str(&result.tagged.to_string());
                    out.push('\n');
                    decoded += 1;
                }
                Err(EmError::NoViterbiPath) => {
                    warn!(
                        local = %partition.location,
                        linha = numbered.line,
                        "nenhum caminho de Viterbi, sequência fora da saída"
                    );
                    undecodable += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(DecodedPartition {
            path: self.config.tagged_path(partition.index),
            text: out,
            decoded,
            undecodable,
        })
    }

    /// Decodifica o corpus inteiro com o modelo da iteração indicada.
    ///
    /// Os arquivos de saída só são gravados depois que todas as tarefas
    /// terminaram com sucesso.
    fn decode(
        &self,
        iteration: usize,
        start_state: &str,
        partitions: &[CorpusPartition],
    ) -> Result<Vec<DecodedPartition>> {
        let model = self.read_snapshot(iteration)?.model;
        let job = format!("{}-decode", self.config.job_name);
        let decoded = self.runner.run_map(&job, partitions, |partition: &CorpusPartition| {
            self.decode_partition(&model, start_state, partition)
        })?;
        for partition in &decoded {
            self.storage.write(&partition.path, partition.text.as_bytes())?;
        }
        Ok(decoded)
    }

    /// Executa o treinamento completo.
    pub fn run(&mut self) -> Result<TrainingReport> {
        self.enter(Phase::Seeding);
        let Seed { model, start_state } = self.seed()?;
        let partitions = plan_partitions(
            &self.storage,
            &self.config.corpus,
            self.config.lines_per_partition,
        )?;
        info!(particoes = partitions.len(), corpus = %self.config.corpus, "corpus particionado");
        self.write_snapshot(
            0,
            &ModelSnapshot {
                model,
                log_likelihood: None,
            },
        )?;

        self.enter(Phase::Iterating);
        let limit = self.config.iteration_limit();
        let mut log_likelihoods: Vec<f64> = Vec::new();
        let mut skipped = 0;
        let mut iteration = 0;

        let termination = loop {
            if self.cancel.load(Ordering::SeqCst) {
                warn!(iteracao = iteration, "cancelamento solicitado, encerrando iterações");
                break Termination::Cancelled;
            }
            if limit.is_some_and(|max| iteration >= max) {
                break Termination::MaxIterations;
            }

            let k = iteration + 1;
            let round = self.iterate(k, &start_state, &partitions)?;
            iteration = k;
            skipped = round.likelihood.skipped;
            let current = round.likelihood.log_likelihood;

            let previous = log_likelihoods.last().copied();
            log_likelihoods.push(current);
            info!(
                iteracao = k,
                log_verossimilhanca = current,
                sequencias = round.likelihood.sequences,
                ignoradas = round.likelihood.skipped,
                parametros = round.parameters,
                "rodada EM concluída"
            );

            if let Some(previous) = previous {
                let delta = current - previous;
                if delta < -MONOTONICITY_SLACK {
                    warn!(iteracao = k, anterior = previous, atual = current, "log-verossimilhança diminuiu");
                }
                if delta < self.config.epsilon {
                    break Termination::Converged;
                }
            }
        };
        self.enter(termination.phase());

        self.enter(Phase::Decoding);
        let decoded = self.decode(iteration, &start_state, &partitions)?;
        let final_model = self.read_snapshot(iteration)?.model;
        let model_text_path = self.config.model_text_path();
        self.storage
            .write(&model_text_path, final_model.to_human_readable().as_bytes())?;

        let report = TrainingReport {
            job_name: self.config.job_name.clone(),
            start_state,
            iterations: iteration,
            log_likelihoods,
            termination,
            decoded: decoded.iter().map(|d| d.decoded).sum(),
            undecodable: decoded.iter().map(|d| d.undecodable).sum(),
            skipped,
            final_model_path: self.config.model_path(iteration),
            model_text_path,
            tagged_paths: decoded.into_iter().map(|d| d.path).collect(),
        };
        info!(
            iteracoes = report.iterations,
            termino = ?report.termination,
            decodificadas = report.decoded,
            sem_caminho = report.undecodable,
            "treinamento concluído"
        );
        self.enter(Phase::Done);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::{LocalRunner, LocalStorage, MemoryStorage};

    const TRANS: &str = "# A\n# B\nA A\nA B\nB A\nB B\n";
    const EMIS: &str = "A x\nA y\nB x\nB y\n";

    fn config(max_iterations: i64) -> EmConfig {
        EmConfig {
            job_name: "teste".into(),
            corpus: "corpus".into(),
            output: "out".into(),
            transitions: "t.txt".into(),
            emissions: "e.txt".into(),
            epsilon: 1e-9,
            max_iterations,
            seed: 11,
            workers: 2,
            lines_per_partition: 2,
            max_attempts: 2,
            ..EmConfig::default()
        }
    }

    fn storage_with(corpus: &str) -> MemoryStorage {
        let storage = MemoryStorage::new();
        storage.insert("t.txt", TRANS);
        storage.insert("e.txt", EMIS);
        storage.insert("corpus/part-a.txt", corpus);
        storage
    }

    fn controller(storage: MemoryStorage, max_iterations: i64) -> EmController<MemoryStorage, LocalRunner> {
        let config = config(max_iterations);
        let runner = LocalRunner::new(config.workers, config.max_attempts).unwrap();
        EmController::new(storage, runner, config).unwrap()
    }

    const CORPUS: &str = "x x y\ny y y x\nx y\n\ny x x x\nx x\ny\n";

    #[test]
    fn test_duplicate_seed_pair_aborts_without_output() {
        let storage = storage_with(CORPUS);
        storage.insert("t.txt", "# A\nA A\n# A\n");
        let mut ctl = controller(storage, 3);
        let err = ctl.run().unwrap_err();
        assert!(matches!(err, EmError::DuplicatePair { line: 3, .. }));
        assert!(ctl.storage().paths().iter().all(|p| !p.starts_with("out/")));
        assert_eq!(ctl.phase(), Phase::Seeding);
    }

    #[test]
    fn test_single_sequence_one_iteration_is_normalized() {
        let mut ctl = controller(storage_with("x y y x\n"), 1);
        let report = ctl.run().unwrap();
        assert_eq!(report.iterations, 1);
        assert_eq!(report.termination, Termination::MaxIterations);
        assert_eq!(report.log_likelihoods.len(), 1);

        let bytes = ctl.storage().read("out/1/em_model_params.jsonl").unwrap();
        let snapshot = ModelSnapshot::from_jsonl(&bytes, "out/1").unwrap();
        assert!(snapshot.model.max_normalization_error() < 1e-9);
        assert_eq!(snapshot.log_likelihood, Some(report.log_likelihoods[0]));
        assert_eq!(ctl.phase(), Phase::Done);
    }

    #[test]
    fn test_likelihood_never_decreases() {
        let mut ctl = controller(storage_with(CORPUS), 8);
        let report = ctl.run().unwrap();
        assert!(report.iterations >= 2);
        for pair in report.log_likelihoods.windows(2) {
            assert!(pair[1] - pair[0] >= -MONOTONICITY_SLACK, "{pair:?}");
        }
        // um snapshot por iteração, mais o Model(0)
        for k in 0..=report.iterations {
            assert!(ctl.storage().read(&format!("out/{k}/em_model_params.jsonl")).is_ok());
        }
    }

    #[test]
    fn test_converges_with_loose_epsilon() {
        let storage = storage_with(CORPUS);
        let mut config = config(-1);
        config.epsilon = 1e6;
        let runner = LocalRunner::new(1, 1).unwrap();
        let mut ctl = EmController::new(storage, runner, config).unwrap();
        let report = ctl.run().unwrap();
        // L(0) não existe: a primeira rodada nunca converge
        assert_eq!(report.iterations, 2);
        assert_eq!(report.termination, Termination::Converged);
    }

    #[test]
    fn test_decoding_writes_one_file_per_partition() {
        let mut ctl = controller(storage_with(CORPUS), 3);
        let report = ctl.run().unwrap();
        // 7 linhas, 2 por partição
        assert_eq!(report.tagged_paths.len(), 4);
        assert_eq!(report.tagged_paths[0], "out/tagged/part-00000");
        assert_eq!(report.decoded + report.undecodable, 6);

        let text = String::from_utf8(ctl.storage().read("out/tagged/part-00000").unwrap()).unwrap();
        let first = text.lines().next().unwrap();
        assert!(first.starts_with("(x,"));
        assert_eq!(first.split(' ').count(), 3);

        let readable = ctl.storage().read("out/model.txt").unwrap();
        assert!(!readable.is_empty());
    }

    #[test]
    fn test_cancelled_run_still_decodes() {
        let mut ctl = controller(storage_with(CORPUS), -1);
        ctl.cancel_flag().store(true, Ordering::SeqCst);
        let report = ctl.run().unwrap();
        assert_eq!(report.termination, Termination::Cancelled);
        assert_eq!(report.iterations, 0);
        assert_eq!(report.final_model_path, "out/0/em_model_params.jsonl");
        assert!(ctl.storage().read("out/tagged/part-00000").is_ok());
    }

    #[test]
    fn test_malformed_corpus_line_aborts_round() {
        let mut ctl = controller(storage_with("x y\ny \u{7}x\n"), 3);
        let err = ctl.run().unwrap_err();
        assert!(matches!(err, EmError::CorpusParse { line: 2, .. }));
        assert!(ctl.storage().read("out/0/em_model_params.jsonl").is_ok());
        assert!(ctl.storage().read("out/1/em_model_params.jsonl").is_err());
    }

    #[test]
    fn test_runs_are_reproducible() {
        let run = || {
            let mut ctl = controller(storage_with(CORPUS), 4);
            let report = ctl.run().unwrap();
            let model = ctl.storage().read(&report.final_model_path).unwrap();
            let tagged = ctl.storage().read("out/tagged/part-00001").unwrap();
            (model, tagged)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_local_storage_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.write("t.txt", TRANS.as_bytes()).unwrap();
        storage.write("e.txt", EMIS.as_bytes()).unwrap();
        storage.write("corpus/a.txt", CORPUS.as_bytes()).unwrap();

        let config = config(2);
        let runner = LocalRunner::new(2, 2).unwrap();
        let mut ctl = EmController::new(storage, runner, config).unwrap();
        let report = ctl.run().unwrap();
        assert_eq!(report.iterations, 2);
        assert!(dir.path().join("out/2/em_model_params.jsonl").is_file());
        assert!(dir.path().join("out/model.txt").is_file());
    }

    /// Armazenamento que passa a falhar leituras de um caminho a partir da
    /// n-ésima leitura.
    struct FailingReads {
        inner: MemoryStorage,
        path: String,
        fail_from: u32,
        reads: std::sync::atomic::AtomicU32,
    }

    impl Storage for FailingReads {
        fn read(&self, path: &str) -> Result<Vec<u8>> {
            if path == self.path && self.reads.fetch_add(1, Ordering::SeqCst) + 1 >= self.fail_from {
                return Err(EmError::Storage {
                    path: path.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disco indisponível"),
                });
            }
            self.inner.read(path)
        }

        fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
            self.inner.write(path, bytes)
        }

        fn list(&self, path: &str) -> Result<Vec<String>> {
            self.inner.list(path)
        }
    }

    #[test]
    fn test_failed_decode_leaves_no_tagged_output() {
        let inner = storage_with("x y\ny x\n");
        inner.insert("corpus/part-b.txt", "x x\ny y\n");
        // leituras de part-b: particionamento, rodada 1, decodificação (falha)
        let storage = FailingReads {
            inner,
            path: "corpus/part-b.txt".into(),
            fail_from: 3,
            reads: std::sync::atomic::AtomicU32::new(0),
        };
        let config = config(1);
        let runner = LocalRunner::new(2, 2).unwrap().with_retry_delay(std::time::Duration::ZERO);
        let mut ctl = EmController::new(storage, runner, config).unwrap();

        let err = ctl.run().unwrap_err();
        assert!(matches!(err, EmError::TaskFailed { attempts: 2, .. }), "{err}");
        let paths = ctl.storage().inner.paths();
        assert!(paths.iter().any(|p| p == "out/1/em_model_params.jsonl"));
        assert!(paths.iter().all(|p| !p.starts_with("out/tagged/")), "{paths:?}");
        assert!(!paths.iter().any(|p| p == "out/model.txt"));
    }

    #[test]
    fn test_undecodable_line_is_left_out_of_tagged_output() {
        let mut ctl = controller(storage_with("x y\nx z\ny y\n"), 2);
        let report = ctl.run().unwrap();
        assert_eq!(report.undecodable, 1);
        assert_eq!(report.decoded, 2);
        // a linha com token desconhecido também não contribui para o treino
        assert_eq!(report.skipped, 1);

        let first = String::from_utf8(ctl.storage().read("out/tagged/part-00000").unwrap()).unwrap();
        let lines: Vec<&str> = first.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("(x,"));
        assert!(lines[0].contains(" (y,"));
        assert!(!first.contains("(z,"));

        let second = String::from_utf8(ctl.storage().read("out/tagged/part-00001").unwrap()).unwrap();
        assert_eq!(second.lines().count(), 1);
        assert!(second.starts_with("(y,"));
    }

    #[test]
    fn test_topology_with_invalid_utf8_aborts_seeding() {
        let storage = storage_with(CORPUS);
        storage.insert("e.txt", vec![b'A', b' ', b'x', b'\n', b'B', b' ', 0xff, b'\n']);
        let mut ctl = controller(storage, 2);
        let err = ctl.run().unwrap_err();
        assert!(matches!(err, EmError::TopologyParse { line: 2, .. }));
        assert!(ctl.storage().paths().iter().all(|p| !p.starts_with("out/")));
    }
}
