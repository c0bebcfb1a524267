//! Methods for locating and reading input files

use std::{io, path};

use fs_err as fs;

/// Recursively collect every file under `root` whose name ends in
/// `task.json`, sorted by path so repeated runs see the same order.
pub(crate) fn find_task_files(root: &path::Path) -> io::Result<Vec<path::PathBuf>> {
    let mut found = Vec::new();
    walk(root, &mut found)?;
    found.sort();
    Ok(found)
}

fn walk(dir: &path::Path, out: &mut Vec<path::PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk(&path, out)?;
        } else if path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with("task.json"))
        {
            out.push(path);
        }
    }
    Ok(())
}
