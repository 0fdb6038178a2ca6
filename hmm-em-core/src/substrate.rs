//! # Substrato de Execução e Armazenamento
//!
//! O treinador não implementa um cluster: ele consome dois contratos.
//!
//! - [`Storage`]: leitura/escrita de bytes endereçados por caminho (`a/b/c`).
//! - [`JobRunner`]: executa um job map/reduce com **barreira** entre as fases.
//!   Todos os maps terminam antes que qualquer reduce comece, e cada reduce
//!   recebe *todos* os valores emitidos para a sua chave.
//!
//! Este módulo traz implementações de máquina única:
//!
//! | Tipo            | Papel                                                     |
//! |-----------------|-----------------------------------------------------------|
//! | `MemoryStorage` | mapa em memória (testes, execuções efêmeras)              |
//! | `LocalStorage`  | diretório local, com escrita atômica via arquivo temporário |
//! | `LocalRunner`   | pool `rayon` dedicado, shuffle ordenado e retentativas    |
//!
//! ## Retentativas
//!
//! Tarefas são funções puras das suas entradas, então reexecutá-las é seguro.
//! O `LocalRunner` reexecuta uma tarefa cujo erro é transitório
//! ([`EmError::is_transient`]) até `max_attempts` vezes, esperando entre as
//! tentativas um intervalo que dobra a cada falha (`retry_delay`, `2·retry_delay`, ...).
//! Erros não transitórios (parse, por exemplo) abortam o job na primeira ocorrência.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{EmError, Result};

/// Armazenamento endereçado por caminho.
pub trait Storage: Send + Sync {
    /// Conteúdo completo de um arquivo.
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Grava (ou substitui) um arquivo por inteiro.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<()>;

    /// Arquivos sob `path`, em ordem lexicográfica. Se `path` é um arquivo,
    /// devolve apenas ele.
    fn list(&self, path: &str) -> Result<Vec<String>>;
}

/// Executor de jobs map/reduce.
pub trait JobRunner: Send + Sync {
    /// Roda `map` em cada partição, agrupa os pares por chave e roda `reduce`
    /// uma vez por chave. A saída vem em ordem de chave.
    fn run<P, K, V, O, M, R>(&self, job: &str, partitions: &[P], map: M, reduce: R) -> Result<Vec<O>>
    where
        P: Sync,
        K: Ord + Send,
        V: Send,
        O: Send,
        M: Fn(&P) -> Result<Vec<(K, V)>> + Sync,
        R: Fn(&K, &[V]) -> Result<O> + Sync;

    /// Job apenas com a fase de map. A saída vem na ordem das partições.
    fn run_map<P, O, M>(&self, job: &str, partitions: &[P], map: M) -> Result<Vec<O>>
    where
        P: Sync,
        O: Send,
        M: Fn(&P) -> Result<O> + Sync;
}

/// Junta dois segmentos de caminho com `/`.
pub fn join(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}

fn not_found(path: &str) -> EmError {
    EmError::storage(path, io::Error::new(io::ErrorKind::NotFound, "caminho inexistente"))
}

// =====================================================================
// MemoryStorage
// =====================================================================

/// Armazenamento em memória.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atalho para popular o armazenamento em testes e ferramentas.
    pub fn insert(&self, path: &str, contents: impl Into<Vec<u8>>) {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), contents.into());
    }

    /// Todos os caminhos gravados.
    pub fn paths(&self) -> Vec<String> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.insert(path, bytes);
        Ok(())
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        if files.contains_key(path) {
            return Ok(vec![path.to_string()]);
        }
        let prefix = join(path, "");
        let found: Vec<String> = files
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        if found.is_empty() {
            return Err(not_found(path));
        }
        Ok(found)
    }
}

// =====================================================================
// LocalStorage
// =====================================================================

/// Armazenamento num diretório local. Caminhos são relativos à raiz.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn walk(&self, dir: &Path, relative: &str, out: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // arquivos temporários de escritas em andamento
            if name.starts_with('.') {
                continue;
            }
            let child = join(relative, &name);
            if entry.file_type()?.is_dir() {
                self.walk(&entry.path(), &child, out)?;
            } else {
                out.push(child);
            }
        }
        Ok(())
    }
}

impl Storage for LocalStorage {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.resolve(path)).map_err(|e| EmError::storage(path, e))
    }

    /// Escreve num arquivo temporário do mesmo diretório e renomeia por cima
    /// do destino: leitores nunca veem um arquivo pela metade.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let target = self.resolve(path);
        let parent = target.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| EmError::storage(path, e))?;

        let mut temp = NamedTempFile::new_in(parent).map_err(|e| EmError::storage(path, e))?;
        temp.write_all(bytes).map_err(|e| EmError::storage(path, e))?;
        temp.persist(&target)
            .map_err(|e| EmError::storage(path, e.error))?;
        Ok(())
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let resolved = self.resolve(path);
        let meta = fs::metadata(&resolved).map_err(|e| EmError::storage(path, e))?;
        if meta.is_file() {
            return Ok(vec![path.to_string()]);
        }
        let mut out = Vec::new();
        self.walk(&resolved, path.trim_end_matches('/'), &mut out)
            .map_err(|e| EmError::storage(path, e))?;
        out.sort();
        Ok(out)
    }
}

// =====================================================================
// LocalRunner
// =====================================================================

/// Executor map/reduce numa única máquina, sobre um pool `rayon` próprio.
pub struct LocalRunner {
    pool: ThreadPool,
    max_attempts: u32,
    retry_delay: Duration,
}

/// Espera antes da primeira reexecução.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

impl LocalRunner {
    /// `workers == 0` deixa o `rayon` escolher (número de CPUs).
    pub fn new(workers: usize, max_attempts: u32) -> Result<Self> {
        if max_attempts == 0 {
            return Err(EmError::InvalidConfig(
                "max_attempts precisa ser pelo menos 1".into(),
            ));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("em-worker-{i}"))
            .build()
            .map_err(|e| EmError::InvalidConfig(format!("pool de workers: {e}")))?;
        Ok(Self {
            pool,
            max_attempts,
            retry_delay: DEFAULT_RETRY_DELAY,
        })
    }

    /// Troca a espera base entre tentativas.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Espera antes da tentativa `attempt + 1`.
    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(1u32 << (attempt - 1).min(16))
    }

    fn attempt<T>(&self, task: String, f: impl Fn() -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        %task,
                        attempt,
                        espera_ms = delay.as_millis() as u64,
                        erro = %e,
                        "falha transitória, reexecutando tarefa"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(EmError::TaskFailed {
                        task,
                        attempts: attempt,
                        source: Box::new(e),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl JobRunner for LocalRunner {
    fn run<P, K, V, O, M, R>(&self, job: &str, partitions: &[P], map: M, reduce: R) -> Result<Vec<O>>
    where
        P: Sync,
        K: Ord + Send,
        V: Send,
        O: Send,
        M: Fn(&P) -> Result<Vec<(K, V)>> + Sync,
        R: Fn(&K, &[V]) -> Result<O> + Sync,
    {
        let mapped: Vec<Vec<(K, V)>> = self.pool.install(|| {
            partitions
                .par_iter()
                .enumerate()
                .map(|(i, p)| self.attempt(format!("{job}/map-{i}"), || map(p)))
                .collect::<Result<Vec<_>>>()
        })?;

        // barreira: daqui em diante todos os maps terminaram
        let mut groups: BTreeMap<K, Vec<V>> = BTreeMap::new();
        for (key, value) in mapped.into_iter().flatten() {
            groups.entry(key).or_default().push(value);
        }
        debug!(job, partitions = partitions.len(), keys = groups.len(), "shuffle concluído");

        let groups: Vec<(K, Vec<V>)> = groups.into_iter().collect();
        self.pool.install(|| {
            groups
                .into_par_iter()
                .enumerate()
                .map(|(i, (key, values))| {
                    self.attempt(format!("{job}/reduce-{i}"), || reduce(&key, &values))
                })
                .collect::<Result<Vec<_>>>()
        })
    }

    fn run_map<P, O, M>(&self, job: &str, partitions: &[P], map: M) -> Result<Vec<O>>
    where
        P: Sync,
        O: Send,
        M: Fn(&P) -> Result<O> + Sync,
    {
        self.pool.install(|| {
            partitions
                .par_iter()
                .enumerate()
                .map(|(i, p)| self.attempt(format!("{job}/map-{i}"), || map(p)))
                .collect::<Result<Vec<_>>>()
        })
    }
}
