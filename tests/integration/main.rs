//! Integration tests for hotspot-imager

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;

    fn imager() -> Command {
        cargo_bin_cmd!("hotspot-imager")
    }

    fn write_recipe(dir: &std::path::Path, text: &str) -> std::path::PathBuf {
        let path = dir.join("recipe.yaml");
        std::fs::write(&path, text).unwrap();
        path
    }

    const CONTENT_ONLY: &str = r#"
base:
  source: "1.2.0"
files:
  - to: /data/conf/hello.txt
    content: "hi\n"
"#;

    #[test]
    fn help_displays() {
        imager()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("hotspot disk image"));
    }

    #[test]
    fn version_displays() {
        imager()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("hotspot-imager"));
    }

    #[test]
    fn output_argument_required() {
        imager().arg("recipe.yaml").assert().failure();
    }

    #[test]
    fn missing_recipe_is_validation_failure() {
        let dir = tempfile::tempdir().unwrap();
        imager()
            .arg(dir.path().join("absent.yaml"))
            .arg(dir.path().join("out.img"))
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("Recipe not found"));
    }

    #[test]
    fn invalid_recipe_is_validation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let recipe = write_recipe(dir.path(), "base: {source: \"\"}\n");
        imager()
            .arg(&recipe)
            .arg(dir.path().join("out.img"))
            .assert()
            .failure()
            .code(1);
    }

    #[test]
    fn conflicting_file_entry_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let recipe = write_recipe(
            dir.path(),
            "base: {source: \"1.2.0\"}\nfiles:\n  - {to: /data/x, url: \"https://h/x\", content: y}\n",
        );
        imager()
            .arg(&recipe)
            .arg(dir.path().join("out.img"))
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("both url and content"));
    }

    #[test]
    fn existing_output_without_overwrite_refused() {
        let dir = tempfile::tempdir().unwrap();
        let recipe = write_recipe(dir.path(), CONTENT_ONLY);
        let output = dir.path().join("out.img");
        std::fs::write(&output, b"previous").unwrap();

        imager()
            .arg(&recipe)
            .arg(&output)
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("exists"));

        // the previous image is untouched
        assert_eq!(std::fs::read(&output).unwrap(), b"previous");
    }

    #[test]
    fn bad_max_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let recipe = write_recipe(dir.path(), CONTENT_ONLY);
        imager()
            .args(["--max-size", "lots"])
            .arg(&recipe)
            .arg(dir.path().join("out.img"))
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("Invalid size"));
    }

    #[test]
    fn oversized_explicit_output_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let recipe = write_recipe(
            dir.path(),
            "base: {source: \"1.2.0\"}\noutput: {size: 8GiB}\n",
        );
        imager()
            .args(["--max-size", "1GiB"])
            .arg(&recipe)
            .arg(dir.path().join("out.img"))
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("exceeds"));
    }
}
