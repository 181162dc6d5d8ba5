//! Implementations of progress callbacks that render progress bars
use s3sling::Result;
use std::{borrow::Cow, future::Future, time::Duration};

/// Display a spinner while some long-running but unmeasurable task is running, then hide the
/// spinner when it finishes
pub(crate) async fn with_spinner<S, F, T>(globals: &super::Globals, message: S, task: F) -> T
where
    S: Into<Cow<'static, str>>,
    F: Future<Output = T>,
{
    let spinner = if !hide_progress(globals) {
        indicatif::ProgressBar::new_spinner()
    } else {
        indicatif::ProgressBar::hidden()
    };

    spinner.set_style(
        indicatif::ProgressStyle::with_template("{spinner:.blue} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );

    spinner.enable_steady_tick(Duration::from_millis(120));

    spinner.set_message(message);

    let result = task.await;

    spinner.finish_and_clear();

    result
}

/// Run the specified upload job, with a progress bar for extra pretty-ness
pub(crate) async fn run_upload_job(
    globals: &super::Globals,
    job: s3sling::UploadJob,
) -> Result<s3sling::UploadResult> {
    struct UploadProgressReport {
        bar: indicatif::ProgressBar,
    }

    impl s3sling::UploadProgressCallback for UploadProgressReport {
        fn bytes_uploaded(&self, bytes: usize) {
            self.bar.inc(bytes as u64);
        }

        fn upload_complete(&self, _total_bytes: u64) {
            self.bar.finish_and_clear();
        }
    }

    let bar = bytes_bar(hide_progress(globals), "uploading", job.total_bytes());

    job.run(Box::new(UploadProgressReport { bar })).await
}

/// Run the specified download job, with a progress bar for extra pretty-ness
pub(crate) async fn run_download_job(
    globals: &super::Globals,
    job: s3sling::DownloadJob,
) -> Result<s3sling::DownloadResult> {
    struct DownloadProgressReport {
        bar: indicatif::ProgressBar,
    }

    impl s3sling::DownloadProgressCallback for DownloadProgressReport {
        fn chunk_downloaded(&self, _chunk_index: usize, bytes: usize) {
            self.bar.inc(bytes as u64);
        }

        fn download_complete(&self, _total_bytes: u64) {
            self.bar.finish_and_clear();
        }
    }

    let bar = bytes_bar(hide_progress(globals), "downloading", job.total_bytes());

    job.run(Box::new(DownloadProgressReport { bar })).await
}

/// Progress should be hidden for either of verbose mode (because there will be a flurry of log
/// messages and the progress bar rendering will be all messed up), or quiet mode (because
/// progress bars are not quiet).
fn hide_progress(globals: &super::Globals) -> bool {
    globals.verbose || globals.quiet
}

/// A byte-counting progress bar for a transfer whose total size is known up front.
fn bytes_bar(hide_progress: bool, prefix: &'static str, total: u64) -> indicatif::ProgressBar {
    let bar = if !hide_progress {
        indicatif::ProgressBar::new(total)
    } else {
        indicatif::ProgressBar::hidden()
    };

    bar.set_style(
        indicatif::ProgressStyle::with_template(
            "{spinner:.green} {prefix}: [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
        )
        .unwrap()
        .progress_chars("#>-"),
    );
    bar.set_prefix(prefix);
    bar.enable_steady_tick(Duration::from_millis(120));

    bar
}
