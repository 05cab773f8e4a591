use std::path::Path;

use tracing::info;

use crate::cds::{ArchiveClient, build_query};
use crate::dataset::Dataset;
use crate::domain::Period;
use crate::error::EtlError;
use crate::netcdf_reader::DatasetReader;
use crate::retry::RetryPolicy;

/// Retrieves one variable for one month and opens it.
pub struct Fetcher<C: ArchiveClient, R: DatasetReader> {
    client: C,
    reader: R,
    dataset: String,
    retry: RetryPolicy,
}

impl<C: ArchiveClient, R: DatasetReader> Fetcher<C, R> {
    pub fn new(client: C, reader: R, dataset: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client,
            reader,
            dataset: dataset.into(),
            retry,
        }
    }

    /// Downloads into `workdir/<variable>.nc`; the caller owns `workdir`.
    pub fn fetch(&self, variable: &str, period: Period, workdir: &Path) -> Result<Dataset, EtlError> {
        let request = build_query(variable, period);
        let destination = workdir.join(format!("{variable}.nc"));
        let label = format!("{period} - {variable}");
        self.retry.run(&label, |attempt| {
            if attempt > 1 {
                info!("retrying {label} (attempt {attempt}/{})", self.retry.max_attempts);
            }
            self.client
                .retrieve(&self.dataset, &request, &destination)?;
            self.reader.open(&destination)
        })
    }
}
