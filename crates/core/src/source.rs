//! Environment (`.dme`) file selection and include augmentation.

use crate::error::{ErrorCode, JobError};

/// Extension of the compiler's project entry file.
pub const SOURCE_EXTENSION: &str = "dme";

/// Whether `file_name` names a compiler project file.
pub fn is_source_file(file_name: &str) -> bool {
    std::path::Path::new(file_name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(SOURCE_EXTENSION))
}

/// Pick the project file to compile.
///
/// With an explicit `project_name` (extension optional) that file must be
/// among `candidates`. Without one, exactly one candidate must exist.
pub fn resolve_source_file(
    project_name: Option<&str>,
    candidates: &[String],
) -> Result<String, JobError> {
    if let Some(name) = project_name.map(str::trim).filter(|n| !n.is_empty()) {
        let wanted = if is_source_file(name) {
            name.to_string()
        } else {
            format!("{name}.{SOURCE_EXTENSION}")
        };
        return candidates
            .iter()
            .find(|c| **c == wanted)
            .cloned()
            .ok_or_else(|| {
                JobError::domain(
                    ErrorCode::DeploymentNoSourceFile,
                    format!("Unable to find {wanted}!"),
                )
            });
    }

    match candidates {
        [] => Err(JobError::domain(
            ErrorCode::DeploymentNoSourceFile,
            "Unable to find any .dme!",
        )),
        [single] => Ok(single.clone()),
        many => Err(JobError::domain(
            ErrorCode::DeploymentAmbiguousSourceFile,
            format!(
                "Found {} .dme files ({}); set a project name to choose one",
                many.len(),
                many.join(", ")
            ),
        )),
    }
}

/// Wrap a project file's contents with `#include` directives.
pub fn augment_source(original: &str, prepend: &[String], append: &[String]) -> String {
    let mut out = String::with_capacity(original.len() + 64 * (prepend.len() + append.len()));
    for include in prepend {
        out.push_str(&include_directive(include));
    }
    out.push_str(original);
    if !original.is_empty() && !original.ends_with('\n') {
        out.push('\n');
    }
    for include in append {
        out.push_str(&include_directive(include));
    }
    out
}

fn include_directive(path: &str) -> String {
    format!("#include \"{path}\"\n")
}
