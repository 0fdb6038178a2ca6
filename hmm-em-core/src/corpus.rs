//! # Corpus de Observações
//!
//! O corpus é texto puro, uma sequência de observações por linha, tokens
//! separados por espaço em branco:
//!
//! ```text
//! the dog barks
//! a cat sleeps
//! ```
//!
//! O local do corpus pode ser um arquivo ou um diretório (todos os arquivos
//! sob ele, em ordem). Cada arquivo é dividido em [`CorpusPartition`]s de no
//! máximo `lines_per_partition` linhas; as partições são a unidade de trabalho
//! das tarefas de map.
//!
//! Uma partição guarda apenas *onde* estão as suas linhas. Quem executa a
//! tarefa lê o trecho do armazenamento, de modo que o corpus é relido a cada
//! rodada e nunca fica em estado compartilhado entre tarefas.
//!
//! ## Linhas inválidas
//! - linhas em branco são ignoradas;
//! - linhas que não são UTF-8 válido, ou que contêm caracteres de controle
//!   (exceto espaço em branco), falham com `CorpusParse`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EmError, Result};
use crate::substrate::Storage;

/// Sequência ordenada e imutável de tokens observados.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObservationSequence {
    tokens: Vec<String>,
}

impl ObservationSequence {
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl<'a> FromIterator<&'a str> for ObservationSequence {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(str::to_string).collect())
    }
}

impl fmt::Display for ObservationSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tokens.join(" "))
    }
}

/// Sequência lida do corpus, com o número (1-based) da linha de origem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumberedSequence {
    pub line: usize,
    pub sequence: ObservationSequence,
}

/// Converte uma linha do corpus. `Ok(None)` para linhas em branco.
pub fn parse_line(line: &str, location: &str, line_no: usize) -> Result<Option<ObservationSequence>> {
    if let Some(c) = line.chars().find(|c| c.is_control() && !c.is_whitespace()) {
        return Err(EmError::CorpusParse {
            location: location.to_string(),
            line: line_no,
            reason: format!("caractere de controle {c:?}"),
        });
    }
    let sequence: ObservationSequence = line.split_whitespace().collect();
    Ok((!sequence.is_empty()).then_some(sequence))
}

/// Quebra bytes em linhas sem decodificar (`\n`, com `\r` final removido).
fn split_lines(bytes: &[u8]) -> Vec<&[u8]> {
    let mut lines: Vec<&[u8]> = bytes
        .split(|&b| b == b'\n')
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
        .collect();
    if lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}

/// Trecho contíguo de linhas de um arquivo do corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusPartition {
    /// Posição global da partição (define o nome do arquivo de saída).
    pub index: usize,
    pub location: String,
    /// Primeira linha (0-based) do trecho.
    pub first_line: usize,
    pub line_count: usize,
}

impl CorpusPartition {
    /// Lê e converte as linhas da partição.
    pub fn load<S: Storage + ?Sized>(&self, storage: &S) -> Result<Vec<NumberedSequence>> {
        let bytes = storage.read(&self.location)?;
        let lines = split_lines(&bytes);

        let mut out = Vec::new();
        for (offset, raw) in lines
            .iter()
            .skip(self.first_line)
            .take(self.line_count)
            .enumerate()
        {
            let line_no = self.first_line + offset + 1;
            let text = std::str::from_utf8(raw).map_err(|e| EmError::CorpusParse {
                location: self.location.clone(),
                line: line_no,
                reason: format!("UTF-8 inválido: {e}"),
            })?;
            if let Some(sequence) = parse_line(text, &self.location, line_no)? {
                out.push(NumberedSequence {
                    line: line_no,
                    sequence,
                });
            }
        }
        Ok(out)
    }
}

/// Divide o corpus em partições de no máximo `lines_per_partition` linhas.
pub fn plan_partitions<S: Storage + ?Sized>(
    storage: &S,
    corpus_location: &str,
    lines_per_partition: usize,
) -> Result<Vec<CorpusPartition>> {
    if lines_per_partition == 0 {
        return Err(EmError::InvalidConfig(
            "lines_per_partition precisa ser maior que zero".into(),
        ));
    }

    let mut partitions = Vec::new();
    for location in storage.list(corpus_location)? {
        let total = split_lines(&storage.read(&location)?).len();
        for first_line in (0..total).step_by(lines_per_partition) {
            partitions.push(CorpusPartition {
                index: partitions.len(),
                location: location.clone(),
                first_line,
                line_count: lines_per_partition.min(total - first_line),
            });
        }
    }
    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::MemoryStorage;

    #[test]
    fn test_parse_line_tokenizes_on_whitespace() {
        let seq = parse_line("  the\tdog  barks ", "c", 1).unwrap().unwrap();
        assert_eq!(seq.tokens(), &["the", "dog", "barks"]);
        assert_eq!(seq.to_string(), "the dog barks");
        assert_eq!(parse_line("   ", "c", 1).unwrap(), None);
    }

    #[test]
    fn test_parse_line_rejects_control_characters() {
        let err = parse_line("ok \u{0007}bell", "corpus.txt", 9).unwrap_err();
        assert!(matches!(err, EmError::CorpusParse { line: 9, .. }));
    }

    #[test]
    fn test_split_lines() {
        assert_eq!(split_lines(b"a\r\nb\n"), vec![&b"a"[..], &b"b"[..]]);
        assert_eq!(split_lines(b"a\n\nb"), vec![&b"a"[..], &b""[..], &b"b"[..]]);
        assert!(split_lines(b"").is_empty());
    }

    #[test]
    fn test_plan_partitions_chunks_every_file() {
        let storage = MemoryStorage::new();
        storage.insert("corpus/a.txt", "x y\ny\nx\nx x\nz\n");
        storage.insert("corpus/b.txt", "y y\n");

        let parts = plan_partitions(&storage, "corpus", 2).unwrap();
        let summary: Vec<(usize, &str, usize, usize)> = parts
            .iter()
            .map(|p| (p.index, p.location.as_str(), p.first_line, p.line_count))
            .collect();
        assert_eq!(
            summary,
            vec![
                (0, "corpus/a.txt", 0, 2),
                (1, "corpus/a.txt", 2, 2),
                (2, "corpus/a.txt", 4, 1),
                (3, "corpus/b.txt", 0, 1),
            ]
        );
        assert!(plan_partitions(&storage, "corpus", 0).is_err());
    }

    #[test]
    fn test_partition_load_skips_blank_and_numbers_lines() {
        let storage = MemoryStorage::new();
        storage.insert("c.txt", "a b\n\nc\nd e f\n");
        let part = CorpusPartition {
            index: 0,
            location: "c.txt".into(),
            first_line: 1,
            line_count: 3,
        };
        let seqs = part.load(&storage).unwrap();
        assert_eq!(seqs.len(), 2);
        assert_eq!(seqs[0].line, 3);
        assert_eq!(seqs[0].sequence.tokens(), &["c"]);
        assert_eq!(seqs[1].line, 4);
    }

    #[test]
    fn test_partition_load_rejects_invalid_utf8() {
        let storage = MemoryStorage::new();
        storage.insert("c.txt", vec![b'o', b'k', b'\n', 0xff, 0xfe, b'\n']);
        let part = CorpusPartition {
            index: 0,
            location: "c.txt".into(),
            first_line: 0,
            line_count: 2,
        };
        let err = part.load(&storage).unwrap_err();
        assert!(matches!(err, EmError::CorpusParse { line: 2, .. }));
    }
}
