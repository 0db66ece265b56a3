use toml::{Value, map::Map};

/// Folds imported documents in order, then lays the main document on top.
pub fn merge_documents(imports: Vec<Value>, main: Value) -> Value {
    let base = imports
        .into_iter()
        .fold(Value::Table(Map::new()), merge_two_documents);

    merge_two_documents(base, main)
}

/// Deep merge where `overlay` wins.
///
/// Tables merge key by key; any other value in `overlay` replaces the one in
/// `base` wholesale.
pub fn merge_two_documents(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(mut merged)) => {
            for (key, base_value) in base_table {
                let value = match merged.remove(&key) {
                    Some(overlay_value) => merge_two_documents(base_value, overlay_value),
                    None => base_value,
                };
                merged.insert(key, value);
            }
            Value::Table(merged)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_wins_and_base_keys_survive() {
        let base: Value = toml::from_str("[volume]\nflat_volumes = false\ndeferred_volume = false\n").unwrap();
        let overlay: Value = toml::from_str("[volume]\nflat_volumes = true\n").unwrap();
        let merged = merge_documents(vec![base], overlay);

        let volume = merged.get("volume").unwrap();
        assert_eq!(volume.get("flat_volumes"), Some(&Value::Boolean(true)));
        assert_eq!(volume.get("deferred_volume"), Some(&Value::Boolean(false)));
    }
}
