use serde_json::{Value, json};
use varsync_runtime::JsonRuntime;

pub fn runtime() -> JsonRuntime {
    let mut runtime = JsonRuntime::new();
    let marge = runtime.insert(contact("Marge", "marge@example.com"));
    let bart = runtime.insert(contact("Bart", "bart@example.com"));
    runtime.set_root(json!({
        "name": "Homer",
        "spouse": marge.to_value(),
        "contacts": [marge.to_value(), bart.to_value()],
        "selected": null,
        "count": 0,
    }));

    runtime.register_type("Contact", |properties| {
        let name = properties.get("name").map_or("", String::as_str);
        let email = properties.get("email").map_or("", String::as_str);
        contact(name, email)
    });
    runtime.register_method("increment", |object, _arg| {
        let next = object["count"].as_i64().unwrap_or(0) + 1;
        object["count"] = json!(next);
        json!(next)
    });
    runtime.register_method("select", |object, arg| {
        object["selected"] = arg.clone();
        arg
    });
    runtime
}

fn contact(name: &str, email: &str) -> Value {
    json!({ "name": name, "email": email })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use varsync_runtime::AppRuntime;
    use varsync_runtime::path::Path;

    fn read(runtime: &mut JsonRuntime, raw: &str) -> Value {
        let root = runtime.root().expect("root");
        let path = Path::parse(raw).expect("path");
        runtime.resolve(root, path.segments()).expect("resolve")
    }

    #[test]
    fn root_reaches_contacts_through_references() {
        let mut runtime = runtime();
        assert_eq!(read(&mut runtime, "spouse.name"), json!("Marge"));
        assert_eq!(read(&mut runtime, "contacts.2.email"), json!("bart@example.com"));
        assert_eq!(read(&mut runtime, "selected.name"), Value::Null);
    }

    #[test]
    fn increment_counts() {
        let mut runtime = runtime();
        let root = runtime.root().expect("root");
        let path = Path::parse("increment()").expect("path");
        runtime
            .write(root, path.segments(), Value::Null)
            .expect("call");
        assert_eq!(read(&mut runtime, "count"), json!(1));
    }
}
