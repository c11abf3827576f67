use std::path::Path;

use tracing::debug;

use sandpad_protocol::SeedTree;

use crate::error::SandpadError;

const INDEX_JS: &str = r#"
import express from 'express';
const app = express();
const port = 3000;

app.get('/', (req, res) => {
  res.send('Hello World!');
});

app.listen(port, () => {
  console.log(`Example app listening at http://localhost:${port}`);
});"#;

const PACKAGE_JSON: &str = r#"
{
  "name": "example-project",
  "version": "1.0.0",
  "main": "index.js",
  "scripts": {
    "start": "node index.js"
  },
  "dependencies": {
    "express": "latest",
    "nodemon": "latest"
  }
}"#;

/// Minimal express app served on port 3000.
pub fn default_project() -> SeedTree {
    SeedTree::new()
        .with_file("index.js", INDEX_JS)
        .with_file("package.json", PACKAGE_JSON)
}

/// Read a seed tree from a JSON file in mount format.
pub fn load(path: impl AsRef<Path>) -> Result<SeedTree, SandpadError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    let tree = SeedTree::from_json(&raw)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    debug!(path = %path.display(), entries = tree.names().count(), "loaded seed tree");
    Ok(tree)
}
