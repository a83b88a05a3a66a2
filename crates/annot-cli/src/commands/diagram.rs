//! Diagram command handlers

use std::path::PathBuf;

use anyhow::{Context, Result};

use annot_core::diagram::{image_paths, rewrite_images};

use crate::output::Output;

/// List the images a diagram references, or print it with rewritten paths
pub fn images(file: PathBuf, rewrite_prefix: Option<String>, output: &Output) -> Result<()> {
    let diagram = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read diagram: {:?}", file))?;

    if let Some(prefix) = rewrite_prefix {
        print!("{}", rewrite_images(&diagram, |path| prefixed(&prefix, path)));
        return Ok(());
    }

    let paths = image_paths(&diagram);
    if output.is_json() {
        output.json(&paths)?;
    } else {
        for path in paths {
            println!("{}", path);
        }
    }
    Ok(())
}

/// `prefix` joined to the file name of `path`
fn prefixed(prefix: &str, path: &str) -> String {
    let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    format!("{}/{}", prefix.trim_end_matches('/'), name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed() {
        assert_eq!(prefixed("assets/", "/icons/aws/s3.png"), "assets/s3.png");
        assert_eq!(prefixed("https://cdn", "lambda.png"), "https://cdn/lambda.png");
        assert_eq!(prefixed("x", r"C:\icons\db.png"), "x/db.png");
    }
}
