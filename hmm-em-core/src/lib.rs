//! # hmm-em-core: Treinamento Baum-Welch Distribuído para HMMs Discretos
//!
//! Este crate treina um Hidden Markov Model discreto sem rótulos, pelo
//! algoritmo EM (Baum-Welch), distribuindo o trabalho de cada iteração como um
//! job map/reduce sobre um corpus particionado.
//!
//! ## Arquitetura
//!
//! Cada iteração é uma rodada síncrona:
//!
//! 1.  **Expectation** ([`expectation`]): cada partição do corpus roda o
//!     [`forward_backward`] contra o modelo anterior e emite contagens esperadas,
//!     agrupadas pelo estado de origem.
//! 2.  **Barreira**: o executor ([`substrate::JobRunner`]) só começa os reduces
//!     depois que todos os maps terminaram.
//! 3.  **Maximization** ([`maximization`]): cada estado de origem normaliza as
//!     suas contagens e vira as novas distribuições.
//! 4.  **Controle** ([`controller`]): grava o Model(k) e a log-verossimilhança,
//!     verifica a convergência e, ao final, decodifica o corpus com [`viterbi`].
//!
//! Toda a aritmética de probabilidades é feita em log-space ([`logspace`]).
//!
//! ## Exemplo de Uso
//!
//! ```rust
//! use hmm_em_core::{EmConfig, EmController, LocalRunner, MemoryStorage};
//!
//! let storage = MemoryStorage::new();
//! storage.insert("transitions.txt", "# A\n# B\nA A\nA B\nB A\nB B\n");
//! storage.insert("emissions.txt", "A x\nA y\nB x\nB y\n");
//! storage.insert("corpus/a.txt", "x y y\ny x\nx x y\n");
//!
//! let config = EmConfig {
//!     max_iterations: 5,
//!     ..EmConfig::default()
//! };
//! let runner = LocalRunner::new(2, 3).unwrap();
//! let mut controller = EmController::new(storage, runner, config).unwrap();
//!
//! let report = controller.run().unwrap();
//! println!("{} iterações, L = {:?}", report.iterations, report.log_likelihoods.last());
//! ```
//!
//! ## Módulos Principais
//!
//! - [`controller`]: máquina de estados do treinamento.
//! - [`substrate`]: contratos de armazenamento e execução, e implementações locais.
//! - [`seed`]: topologia e Model(0).
//! - [`eval`]: acurácia many-to-one da saída decodificada.

pub mod config;
pub mod controller;
pub mod corpus;
pub mod error;
pub mod eval;
pub mod expectation;
pub mod forward_backward;
pub mod logspace;
pub mod maximization;
pub mod model;
pub mod seed;
pub mod substrate;
pub mod viterbi;

pub use config::EmConfig;
pub use controller::{EmController, Phase, Termination, TrainingReport};
pub use error::{EmError, Result};
pub use eval::{evaluate, EvalReport, TaggingParser};
pub use model::{Model, ModelParameter, ModelSnapshot, ParameterKind, StatePair};
pub use substrate::{JobRunner, LocalRunner, LocalStorage, MemoryStorage, Storage};
pub use viterbi::{viterbi_decode, TaggedSequence};
