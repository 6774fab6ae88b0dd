//! Construction macros

/// Build a [`Document`](crate::Document) from `"name": value` pairs
///
/// ```
/// use ouroboros_bson::doc;
/// let cmd = doc! { "ismaster": 1, "comment": "probe" };
/// assert_eq!(cmd.get_i32("ismaster").unwrap(), 1);
/// ```
#[macro_export]
macro_rules! doc {
    () => {
        $crate::Document::new()
    };
    ($($key:literal : $value:expr),+ $(,)?) => {{
        let mut document = $crate::Document::new();
        $(
            document.insert($key, $crate::Bson::from($value));
        )+
        document
    }};
}

/// Build a `Bson::Array` from a list of values
#[macro_export]
macro_rules! bson_array {
    () => {
        $crate::Bson::Array(Vec::new())
    };
    ($($value:expr),+ $(,)?) => {
        $crate::Bson::Array(vec![$($crate::Bson::from($value)),+])
    };
}

#[cfg(test)]
mod tests {
    use crate::{Bson, Document};

    #[test]
    fn test_doc_macro_nesting() {
        let d = doc! {
            "a": 1,
            "inner": doc! { "b": true },
            "list": bson_array![1, "two", 3.0],
        };
        assert_eq!(d.len(), 3);
        assert_eq!(d.get_document("inner").unwrap().get_bool("b").unwrap(), true);
        assert_eq!(
            d.get("list"),
            Some(&Bson::Array(vec![
                Bson::Int32(1),
                Bson::String("two".into()),
                Bson::Double(3.0)
            ]))
        );
    }

    #[test]
    fn test_empty_macros() {
        assert_eq!(doc! {}, Document::new());
        assert_eq!(bson_array![], Bson::Array(vec![]));
    }
}
