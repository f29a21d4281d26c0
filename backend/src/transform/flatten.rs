//! Element flattening.
//!
//! Turns one element subtree into a single-level [`FlatRow`]. Column names
//! are the `_`-joined tag path from the record root, with attributes marked
//! by `_@`:
//!
//! ```text
//! <Product id="1">            Product_@id       = 1
//!   <Name>Widget</Name>   →   Product_Name      = Widget
//!   <Price cur="EUR">9</Price> Product_Price_@cur = EUR
//! </Product>                  Product_Price     = 9
//! ```
//!
//! Duplicate paths (two same-named siblings) resolve last-write-wins, in
//! document order.

use crate::models::{Element, EmptyLeafPolicy, FlatRow};

/// Attribute marker inserted between an element path and an attribute name.
pub const ATTRIBUTE_MARKER: &str = "_@";

/// Separator between tag names in a column path.
pub const PATH_SEPARATOR: &str = "_";

/// Flatten a record element (empty prefix).
pub fn flatten_record(element: &Element, policy: EmptyLeafPolicy) -> FlatRow {
    flatten(element, "", policy)
}

/// Flatten `element` with every column name prefixed by `prefix`.
pub fn flatten(element: &Element, prefix: &str, policy: EmptyLeafPolicy) -> FlatRow {
    let mut row = FlatRow::new();
    flatten_into(element, prefix, policy, &mut row);
    row
}

fn flatten_into(element: &Element, prefix: &str, policy: EmptyLeafPolicy, row: &mut FlatRow) {
    let path = format!("{}{}", prefix, element.tag);

    for (name, value) in &element.attributes {
        row.insert(format!("{}{}{}", path, ATTRIBUTE_MARKER, name), value.clone());
    }

    match &element.text {
        Some(text) => row.insert(path.clone(), text.clone()),
        None if element.is_bare() && policy == EmptyLeafPolicy::Emit => {
            row.insert(path.clone(), String::new())
        }
        None => {}
    }

    if element.children.is_empty() {
        return;
    }

    let child_prefix = format!("{}{}", path, PATH_SEPARATOR);
    for child in &element.children {
        flatten_into(child, &child_prefix, policy, row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pairs(row: &FlatRow) -> Vec<(String, String)> {
        row.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_product_example() {
        let product = Element::new("Product")
            .with_attribute("id", "1")
            .with_child(Element::new("Name").with_text("Widget"));

        let row = flatten_record(&product, EmptyLeafPolicy::Skip);

        assert_eq!(
            pairs(&row),
            vec![
                ("Product_@id".to_string(), "1".to_string()),
                ("Product_Name".to_string(), "Widget".to_string()),
            ]
        );
    }

    #[test]
    fn test_nested_attributes_and_text() {
        let product = Element::new("Product").with_child(
            Element::new("Price")
                .with_attribute("currency", "EUR")
                .with_text(" 9.50 ")
                .with_child(Element::new("Discount").with_attribute("pct", "10")),
        );

        let row = flatten_record(&product, EmptyLeafPolicy::Skip);

        assert_eq!(row.get("Product_Price_@currency"), Some("EUR"));
        assert_eq!(row.get("Product_Price"), Some("9.50"));
        assert_eq!(row.get("Product_Price_Discount_@pct"), Some("10"));
        assert_eq!(row.len(), 3);
    }

    #[test]
    fn test_prefix_is_applied() {
        let el = Element::new("A").with_text("x");
        let row = flatten(&el, "Root_", EmptyLeafPolicy::Skip);
        assert_eq!(row.get("Root_A"), Some("x"));
    }

    #[test]
    fn test_bare_leaf_policies() {
        let item = Element::new("Item")
            .with_child(Element::new("A").with_text("1"))
            .with_child(Element::new("Empty"))
            .with_child(Element::new("Blank").with_text("   "));

        let skipped = flatten_record(&item, EmptyLeafPolicy::Skip);
        assert_eq!(skipped.sorted_columns(), vec!["Item_A"]);

        let emitted = flatten_record(&item, EmptyLeafPolicy::Emit);
        assert_eq!(emitted.sorted_columns(), vec!["Item_A", "Item_Blank", "Item_Empty"]);
        assert_eq!(emitted.get("Item_Empty"), Some(""));
        assert_eq!(emitted.get("Item_Blank"), Some(""));
    }

    #[test]
    fn test_structured_element_without_text_has_no_own_column() {
        let item = Element::new("Item").with_child(Element::new("Tags").with_child(Element::new("Tag").with_text("a")));
        let row = flatten_record(&item, EmptyLeafPolicy::Emit);
        assert!(!row.contains("Item"));
        assert!(!row.contains("Item_Tags"));
        assert_eq!(row.get("Item_Tags_Tag"), Some("a"));
    }

    #[test]
    fn test_duplicate_siblings_last_write_wins() {
        let item = Element::new("Item")
            .with_child(Element::new("Tag").with_attribute("k", "first").with_text("a"))
            .with_child(Element::new("Tag").with_attribute("k", "second").with_text("b"));

        let row = flatten_record(&item, EmptyLeafPolicy::Skip);

        assert_eq!(row.get("Item_Tag"), Some("b"));
        assert_eq!(row.get("Item_Tag_@k"), Some("second"));
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn test_child_overrides_parent_column() {
        // <A><B_x>1</B_x><B><x>2</x></B></A>: both produce A_B_x
        let a = Element::new("A")
            .with_child(Element::new("B_x").with_text("1"))
            .with_child(Element::new("B").with_child(Element::new("x").with_text("2")));
        let row = flatten_record(&a, EmptyLeafPolicy::Skip);
        assert_eq!(row.get("A_B_x"), Some("2"));
    }

    #[test]
    fn test_flatten_is_deterministic() {
        let item = Element::new("Item")
            .with_attribute("id", "7")
            .with_child(Element::new("A").with_text("1"))
            .with_child(Element::new("B").with_child(Element::new("C").with_attribute("z", "q")));

        let first = flatten_record(&item, EmptyLeafPolicy::Emit);
        let second = flatten_record(&item, EmptyLeafPolicy::Emit);
        assert_eq!(first, second);
        assert_eq!(pairs(&first), pairs(&second));
    }
}
