use tree_sitter::Node;
use tree_sitter::Parser;
use tree_sitter_python::LANGUAGE as PYTHON;

use crate::error::GatewayErr;
use crate::error::Result;

const ALLOWED_MODULES: &[&str] = &["pandas", "numpy", "math", "statistics", "re", "datetime"];

const DENIED_ATTRIBUTE_ROOTS: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "socket",
    "shutil",
    "pathlib",
    "ctypes",
    "importlib",
];

const DENIED_CALLS: &[&str] = &["open", "exec", "eval", "compile", "__import__", "input"];

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

fn reject(msg: impl Into<String>) -> GatewayErr {
    GatewayErr::PythonPolicy(msg.into())
}

/// The leftmost identifier of a (possibly chained) attribute expression,
/// e.g. `os.path.join` -> `os`.
fn leftmost_identifier<'a>(node: Node<'a>, src: &'a str) -> Option<&'a str> {
    let mut current = node;
    loop {
        match current.kind() {
            "identifier" => return current.utf8_text(src.as_bytes()).ok(),
            "attribute" | "call" | "subscript" => {
                current = current.child_by_field_name("object")?;
            }
            _ => return None,
        }
        if current.kind() == "call" {
            current = current.child_by_field_name("function")?;
        }
    }
}

fn module_root(dotted: &str) -> &str {
    dotted.split('.').next().unwrap_or(dotted)
}

fn check_node(node: Node, src: &str) -> Result<()> {
    match node.kind() {
        "import_statement" => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                let name_node = if child.kind() == "aliased_import" {
                    child.child_by_field_name("name")
                } else {
                    Some(child)
                };
                if let Some(name_node) = name_node {
                    if let Ok(text) = name_node.utf8_text(src.as_bytes()) {
                        let root = module_root(text);
                        if !ALLOWED_MODULES.contains(&root) {
                            return Err(reject(format!("import of disallowed module `{root}`")));
                        }
                    }
                }
            }
        }
        "import_from_statement" => {
            if let Some(module_node) = node.child_by_field_name("module_name") {
                if let Ok(text) = module_node.utf8_text(src.as_bytes()) {
                    let root = module_root(text);
                    if !ALLOWED_MODULES.contains(&root) {
                        return Err(reject(format!("import of disallowed module `{root}`")));
                    }
                }
            }
        }
        "attribute" => {
            if let Some(attr_node) = node.child_by_field_name("attribute") {
                if let Ok(attr_text) = attr_node.utf8_text(src.as_bytes()) {
                    if is_dunder(attr_text) {
                        return Err(reject(format!("dunder attribute access `.{attr_text}`")));
                    }
                }
            }
            if let Some(obj_node) = node.child_by_field_name("object") {
                if let Some(root) = leftmost_identifier(obj_node, src).or_else(|| {
                    if obj_node.kind() == "identifier" {
                        obj_node.utf8_text(src.as_bytes()).ok()
                    } else {
                        None
                    }
                }) {
                    if DENIED_ATTRIBUTE_ROOTS.contains(&root) {
                        return Err(reject(format!("attribute access into `{root}`")));
                    }
                }
            }
        }
        "call" => {
            if let Some(func_node) = node.child_by_field_name("function") {
                if func_node.kind() == "identifier" {
                    if let Ok(text) = func_node.utf8_text(src.as_bytes()) {
                        if DENIED_CALLS.contains(&text) {
                            return Err(reject(format!("call to `{text}`")));
                        }
                    }
                }
            }
        }
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        check_node(child, src)?;
    }
    Ok(())
}

/// Parse and validate a Python program against the AST allow/deny policy.
/// Returns `Ok(())` when the program may be executed as submitted.
pub fn check_python(source: &str) -> Result<()> {
    let mut parser = Parser::new();
    parser
        .set_language(&PYTHON.into())
        .map_err(|e| GatewayErr::PythonPolicy(format!("failed to load python grammar: {e}")))?;

    let tree = parser
        .parse(source, None)
        .ok_or_else(|| reject("failed to parse python source"))?;

    if tree.root_node().has_error() {
        return Err(reject("python source has a syntax error"));
    }

    check_node(tree.root_node(), source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_pandas_usage() {
        assert!(check_python("import pandas as pd\nresult_df = pd.DataFrame()").is_ok());
    }

    #[test]
    fn rejects_os_import() {
        let err = check_python("import os\nresult = os.listdir('/')").unwrap_err();
        assert!(matches!(err, GatewayErr::PythonPolicy(_)));
    }

    #[test]
    fn rejects_os_attribute_access_without_direct_import() {
        let err = check_python("import os as o\nresult = o.listdir('/')").unwrap_err();
        assert!(matches!(err, GatewayErr::PythonPolicy(_)));
    }

    #[test]
    fn rejects_eval_call() {
        let err = check_python("result = eval('1+1')").unwrap_err();
        assert!(matches!(err, GatewayErr::PythonPolicy(_)));
    }

    #[test]
    fn rejects_dunder_attribute_access() {
        let err = check_python("result = (1).__class__").unwrap_err();
        assert!(matches!(err, GatewayErr::PythonPolicy(_)));
    }

    #[test]
    fn allows_plain_arithmetic() {
        assert!(check_python("result = 1 + 2").is_ok());
    }
}
