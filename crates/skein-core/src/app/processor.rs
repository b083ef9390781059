//! ServiceProcessor - 実行バックエンドとの契約
//!
//! engine は processor を次の順に呼び出す：
//! 1. `prepare`（submit 時。ここで失敗したら何も保存しない）
//! 2. `submit_dependencies`（子サービスを宣言する）
//! 3. `process`（実際の処理。ローカルプロセス・クラスタ・コンテナなど）
//! 4. `is_result_ready` が true になるまで待つ
//! 5. `check_for_errors`
//! 6. `collect_result`
//!
//! `Computation` を返すメソッドは `'static` な future を返すので、
//! 必要な値は record から clone しておくこと。

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::app::computation::Computation;
use crate::domain::{ServiceError, ServiceRecord, ServiceResult};

/// `dictionaryArgs` のキー：標準出力ファイルを置くディレクトリ
pub const OUTPUT_DIR_ARG: &str = "outputDir";
/// `dictionaryArgs` のキー：標準エラーファイルを置くディレクトリ
pub const ERROR_DIR_ARG: &str = "errorDir";

/// Records a processor wants created and finished before `process` runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyResult {
    /// 新しく作る子サービス（未保存）
    pub dependencies: Vec<ServiceRecord>,
}

impl DependencyResult {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn of(dependencies: Vec<ServiceRecord>) -> Self {
        Self { dependencies }
    }
}

/// Results of finished dependencies, handed to `process`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedDependencies {
    pub records: Vec<ServiceRecord>,
}

impl ResolvedDependencies {
    /// `serializableResult` of the dependency called `name`, if any.
    pub fn result_of(&self, name: &str) -> Option<&Value> {
        self.records
            .iter()
            .find(|r| r.name == name)
            .and_then(|r| r.serializable_result.as_ref())
    }
}

#[async_trait]
pub trait ServiceProcessor: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        ""
    }

    /// Validates and normalizes a record before it is queued.
    async fn prepare(&self, record: ServiceRecord) -> ServiceResult<ServiceRecord> {
        Ok(record)
    }

    fn submit_dependencies(&self, _record: &ServiceRecord) -> Computation<DependencyResult> {
        Computation::completed(DependencyResult::none())
    }

    fn process(
        &self,
        record: &ServiceRecord,
        dependencies: ResolvedDependencies,
    ) -> Computation<Value>;

    async fn is_result_ready(&self, _record: &ServiceRecord, _output: &Value) -> ServiceResult<bool> {
        Ok(true)
    }

    /// Fails with `ServiceError::Execution` listing the offending lines.
    async fn check_for_errors(&self, record: &ServiceRecord, output: &Value) -> ServiceResult<()> {
        let errors = ErrorChecker::default().collect_errors(record, output).await?;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::Execution(errors.join("\n")))
        }
    }

    async fn collect_result(&self, _record: &ServiceRecord, output: Value) -> ServiceResult<Value> {
        Ok(output)
    }
}

/// ErrorChecker は出力から失敗のシグネチャを探す
///
/// 大文字小文字を区別せずに `error` / `exception` / `segmentation fault` /
/// `core dumped` を含む行を失敗とみなす。
#[derive(Debug, Clone)]
pub struct ErrorChecker {
    signatures: Vec<String>,
}

impl Default for ErrorChecker {
    fn default() -> Self {
        Self::with_signatures(["error", "exception", "segmentation fault", "core dumped"])
    }
}

impl ErrorChecker {
    pub fn with_signatures<I, S>(signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            signatures: signatures
                .into_iter()
                .map(|s| s.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn has_errors(&self, line: &str) -> bool {
        if line.trim().is_empty() {
            return false;
        }
        let lower = line.to_lowercase();
        self.signatures.iter().any(|s| lower.contains(s.as_str()))
    }

    pub fn scan_text(&self, text: &str) -> Vec<String> {
        text.lines()
            .filter(|l| self.has_errors(l))
            .map(str::to_string)
            .collect()
    }

    /// Scans every string inside a JSON value (e.g. captured stdout/stderr).
    pub fn scan_value(&self, value: &Value) -> Vec<String> {
        let mut found = Vec::new();
        self.scan_value_into(value, &mut found);
        found
    }

    fn scan_value_into(&self, value: &Value, found: &mut Vec<String>) {
        match value {
            Value::String(s) => found.extend(self.scan_text(s)),
            Value::Array(items) => items.iter().for_each(|v| self.scan_value_into(v, found)),
            Value::Object(map) => map.values().for_each(|v| self.scan_value_into(v, found)),
            _ => {}
        }
    }

    /// Scans the files directly inside `dir`. A missing directory has no errors.
    pub async fn scan_dir(&self, dir: &Path) -> ServiceResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ServiceError::execution(format!(
                    "cannot read output dir {}: {e}",
                    dir.display()
                )));
            }
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ServiceError::execution(format!("cannot list {}: {e}", dir.display())))?
        {
            let path = entry.path();
            if path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut found = Vec::new();
        for path in paths {
            let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
                ServiceError::execution(format!("cannot read {}: {e}", path.display()))
            })?;
            debug!(file = %path.display(), "scanning process output");
            found.extend(self.scan_text(&text));
        }
        Ok(found)
    }

    /// Errors from the returned value plus the record's output/error directories.
    pub async fn collect_errors(
        &self,
        record: &ServiceRecord,
        output: &Value,
    ) -> ServiceResult<Vec<String>> {
        let mut errors = self.scan_value(output);
        for key in [OUTPUT_DIR_ARG, ERROR_DIR_ARG] {
            if let Some(Value::String(dir)) = record.dictionary_args.get(key)
                && !dir.trim().is_empty()
            {
                errors.extend(self.scan_dir(Path::new(dir)).await?);
            }
        }
        Ok(errors)
    }
}
