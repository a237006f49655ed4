use crate::enumerate::{Enumerator, ItemDescriptor, Sink};

/// Creates:
///
/// ```text
/// src
/// |- 0.txt
/// |- bar
///    |- 1.txt
///    |- 2.txt
/// |- baz
///    |- 3.txt
/// ```
///
/// Every file holds its own digit, so sizes are one byte.
pub fn local_tree() -> anyhow::Result<tempfile::TempDir> {
    let tmp = tempfile::tempdir()?;
    let src = tmp.path().join("src");
    std::fs::create_dir_all(src.join("bar"))?;
    std::fs::create_dir_all(src.join("baz"))?;
    std::fs::write(src.join("0.txt"), "0")?;
    std::fs::write(src.join("bar").join("1.txt"), "1")?;
    std::fs::write(src.join("bar").join("2.txt"), "2")?;
    std::fs::write(src.join("baz").join("3.txt"), "3")?;
    Ok(tmp)
}

/// Run an emit pass and gather everything it produced
pub async fn collect(enumerator: &dyn Enumerator) -> anyhow::Result<Vec<ItemDescriptor>> {
    let (tx, rx) = async_channel::unbounded();
    enumerator.enumerate(&Sink::Emit(tx)).await?;
    let mut items = Vec::new();
    while let Ok(item) = rx.recv().await {
        items.push(item);
    }
    Ok(items)
}

pub fn keys(items: &[ItemDescriptor]) -> Vec<&str> {
    items.iter().map(|item| item.relative_key.as_str()).collect()
}

/// Set the modification time of `path` to `unix_secs`
pub fn set_mtime(path: &std::path::Path, unix_secs: i64) -> anyhow::Result<()> {
    filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(unix_secs, 0))?;
    Ok(())
}
