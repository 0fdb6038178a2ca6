//! # Erros do Treinamento EM
//!
//! Um único enum cobre toda a taxonomia de falhas do sistema:
//!
//! | Família                 | Variantes                                          | Fatal?                         |
//! |-------------------------|----------------------------------------------------|--------------------------------|
//! | Parse                   | `MalformedLine`, `TopologyParse`, `CorpusParse`, `RecordParse`, `TaggingParse` | sim |
//! | Avaliação               | `LengthMismatch`                                   | sim                            |
//! | Chave duplicada         | `DuplicatePair`                                    | sim (apenas no seeding)        |
//! | Falha de tarefa         | `Storage` (transitória), `TaskFailed`              | após esgotar as tentativas     |
//! | Por sequência           | `InvalidSequence`, `NoViterbiPath`                 | não: a sequência é descartada  |
//! | Invocação               | `InvalidConfig`                                    | sim                            |
//!
//! Atingir o limite de iterações **não** é erro: é um estado terminal normal
//! do controlador (ver [`crate::controller::Termination`]).

use thiserror::Error;

/// Erro unificado do treinador.
#[derive(Debug, Error)]
pub enum EmError {
    /// Linha de topologia que não tem exatamente dois tokens.
    #[error("{location}:{line}: esperados exatamente 2 tokens, encontrados {found}")]
    MalformedLine {
        location: String,
        line: usize,
        found: usize,
    },

    /// Arquivo de topologia ilegível (ex.: bytes que não são UTF-8).
    #[error("{location}:{line}: topologia inválida: {reason}")]
    TopologyParse {
        location: String,
        line: usize,
        reason: String,
    },

    /// Par repetido num arquivo de topologia.
    #[error("{location}:{line}: par duplicado ({first}, {second})")]
    DuplicatePair {
        location: String,
        line: usize,
        first: String,
        second: String,
    },

    /// Linha do corpus que não pode virar uma sequência de observações.
    #[error("{location}:{line}: linha do corpus inválida: {reason}")]
    CorpusParse {
        location: String,
        line: usize,
        reason: String,
    },

    /// Registro persistido (modelo ou log-verossimilhança) ilegível.
    #[error("{location}:{line}: registro inválido: {source}")]
    RecordParse {
        location: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Token `(observação,estado)` malformado numa saída de tagging.
    #[error("{location}:{line}: token de tagging inválido: {token:?}")]
    TaggingParse {
        location: String,
        line: usize,
        token: String,
    },

    /// Saída decodificada e referência com número diferente de tokens.
    #[error("avaliação com tamanhos diferentes: {predicted} tokens decodificados, {gold} na referência")]
    LengthMismatch { predicted: usize, gold: usize },

    /// Sequência vazia entregue ao forward-backward.
    #[error("sequência de observações vazia")]
    InvalidSequence,

    /// Nenhum caminho de estados tem probabilidade > 0 para a sequência.
    #[error("nenhum caminho de Viterbi com probabilidade positiva")]
    NoViterbiPath,

    /// Falha de E/S no armazenamento. Transitória: a tarefa pode ser reexecutada.
    #[error("falha de armazenamento em {path}: {source}")]
    Storage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Uma tarefa falhou em todas as tentativas permitidas pelo executor.
    #[error("tarefa {task} falhou após {attempts} tentativa(s): {source}")]
    TaskFailed {
        task: String,
        attempts: u32,
        #[source]
        source: Box<EmError>,
    },

    /// Falha ao serializar registros para persistência.
    #[error("falha de serialização: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Parâmetros de invocação inválidos.
    #[error("configuração inválida: {0}")]
    InvalidConfig(String),
}

impl EmError {
    /// `true` para falhas que podem desaparecer ao reexecutar a mesma tarefa.
    pub fn is_transient(&self) -> bool {
        matches!(self, EmError::Storage { .. })
    }

    pub(crate) fn storage(path: &str, source: std::io::Error) -> Self {
        EmError::Storage {
            path: path.to_string(),
            source,
        }
    }
}

/// Alias usado em todo o crate.
pub type Result<T> = std::result::Result<T, EmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_storage_is_transient() {
        let io = EmError::storage("a/b", std::io::Error::new(std::io::ErrorKind::Other, "x"));
        assert!(io.is_transient());
        assert!(!EmError::NoViterbiPath.is_transient());
        let failed = EmError::TaskFailed {
            task: "map-0".into(),
            attempts: 3,
            source: Box::new(io),
        };
        assert!(!failed.is_transient());
    }

    #[test]
    fn test_messages_carry_location() {
        let err = EmError::DuplicatePair {
            location: "transitions.txt".into(),
            line: 4,
            first: "A".into(),
            second: "B".into(),
        };
        assert_eq!(err.to_string(), "transitions.txt:4: par duplicado (A, B)");
    }
}
