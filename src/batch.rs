/// Sample-by-sample batch processing that survives per-sample failures.

use anyhow::Context;

use crate::error::HappyError;

/// A sample that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub id: String,
    /// Full error chain, outermost context first.
    pub message: String,
}

/// Outputs of the samples that succeeded and the failures of those that did not.
#[derive(Debug)]
pub struct BatchReport<T> {
    pub outputs: Vec<(String, T)>,
    pub failures: Vec<BatchFailure>,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self {
            outputs: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> BatchReport<T> {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn summary(&self) -> String {
        let total = self.outputs.len() + self.failures.len();
        let mut text = format!("{}/{} samples processed", self.outputs.len(), total);
        for failure in &self.failures {
            text.push_str(&format!("\n  {}: {}", failure.id, failure.message));
        }
        text
    }
}

/// Whether a failure should stop the whole batch.
fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<HappyError>()
        .is_some_and(|e| !e.is_recoverable())
}

/// Runs `process` for every id in order.
///
/// Recoverable failures (shape mismatches, missing data, unreadable files)
/// are logged and collected; configuration and not-fitted errors abort the
/// run with the offending id attached.
pub fn run_batch<T, I, F>(ids: I, mut process: F) -> anyhow::Result<BatchReport<T>>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
    F: FnMut(&str) -> anyhow::Result<T>,
{
    let mut report = BatchReport::default();
    for id in ids {
        let id = id.as_ref();
        match process(id) {
            Ok(output) => report.outputs.push((id.to_string(), output)),
            Err(err) if is_fatal(&err) => {
                return Err(err).with_context(|| format!("batch aborted at '{id}'"));
            }
            Err(err) => {
                log::error!("{id}: {err:#}");
                report.failures.push(BatchFailure {
                    id: id.to_string(),
                    message: format!("{err:#}"),
                });
            }
        }
    }
    log::info!("{}", report.summary().lines().next().unwrap_or_default());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_failures_accumulate() {
        let report = run_batch(["a", "b", "c"], |id| {
            if id == "b" {
                Err(HappyError::shape_mismatch("white reference", &[2, 2, 3], &[1, 2, 3]))
                    .context("normalizing b")
            } else {
                Ok(id.len())
            }
        })
        .unwrap();
        assert_eq!(report.outputs, vec![("a".to_string(), 1), ("c".to_string(), 1)]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, "b");
        assert!(report.failures[0].message.starts_with("normalizing b: shape mismatch"));
        assert!(!report.is_clean());
        assert!(report.summary().starts_with("2/3 samples processed\n  b: "));
    }

    #[test]
    fn fatal_error_aborts() {
        let mut seen = Vec::new();
        let err = run_batch(vec!["a".to_string(), "b".into(), "c".into()], |id| {
            seen.push(id.to_string());
            if id == "b" {
                return Err(HappyError::not_fitted("pca").into());
            }
            Ok(())
        })
        .unwrap_err();
        assert_eq!(seen, vec!["a", "b"]);
        assert!(format!("{err:#}").contains("batch aborted at 'b'"));
        assert!(matches!(err.downcast_ref::<HappyError>(), Some(HappyError::NotFitted(_))));
    }

    #[test]
    fn foreign_errors_are_recoverable() {
        let report = run_batch(["x"], |_| -> anyhow::Result<()> { anyhow::bail!("reader hiccup") })
            .unwrap();
        assert_eq!(report.failures[0].message, "reader hiccup");
    }
}
