//! Progress reporting for scans

use indicatif::{ProgressBar, ProgressStyle};

const FILE_BAR: &str = "{prefix:>18.bold} {bar:36.green/white} {pos:>6}/{len} files  {per_sec:>10}  eta {eta}";

/// Per-file progress over `total` sources, labelled with `label`
///
/// Returns a hidden bar unless `visible`, so callers can always tick it.
pub fn create_progress_bar(total: u64, label: &str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }

    let style = match ProgressStyle::with_template(FILE_BAR) {
        Ok(style) => style.progress_chars("=> "),
        Err(_) => ProgressStyle::default_bar(),
    };
    ProgressBar::new(total)
        .with_style(style)
        .with_prefix(label.to_string())
}

const KIB: u64 = 1 << 10;
const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;

/// Staged artifact volume for `status`, in binary units
pub fn format_bytes(bytes: u64) -> String {
    let scaled = |unit: u64| bytes as f64 / unit as f64;
    match bytes {
        b if b >= GIB => format!("{:.1} GiB", scaled(GIB)),
        b if b >= MIB => format!("{:.1} MiB", scaled(MIB)),
        b if b >= KIB => format!("{:.1} KiB", scaled(KIB)),
        1 => "1 byte".to_string(),
        b => format!("{b} bytes"),
    }
}
