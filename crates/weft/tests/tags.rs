use weft::{Boxed, Engine, ExecuteContext, Graph, Type, Value, add_tags, box_value, get_tags, optional};

fn run(nodes: &[weft::Node]) -> Vec<Boxed> {
    Engine::new().execute(nodes, &ExecuteContext::new()).unwrap()
}

fn tagged_pair(graph: &mut Graph) -> weft::Node {
    let mut boxed = box_value(Value::list([Value::number(10.0), Value::number(20.0)]));
    add_tags(&mut boxed, [("a_tag", Value::number(1.0))]);
    graph.boxed_constant(boxed).unwrap()
}

#[test]
fn tags_flow_through_indexing() {
    let mut graph = Graph::with_builtins();
    let list = tagged_pair(&mut graph);
    let one = graph.constant(1.0);
    let item = graph.call("index", &[list, one]).unwrap();
    let tag = graph.tag(&item, "a_tag").unwrap();

    let out = run(&[item, tag]);
    assert_eq!(out[0], Value::number(20.0));
    assert_eq!(get_tags(&out[0]).get("a_tag"), Some(&Value::number(1.0)));
    assert_eq!(out[1], Value::number(1.0));
}

#[test]
fn indexing_past_the_end_gives_untagged_none() {
    let mut graph = Graph::with_builtins();
    let list = tagged_pair(&mut graph);
    let two = graph.constant(2.0);
    let item = graph.call("index", &[list, two]).unwrap();
    let tag = graph.tag(&item, "a_tag").unwrap();
    assert_eq!(tag.ty(), &optional(Type::Int));

    let out = run(&[item, tag]);
    assert_eq!(out[0], Value::None);
    assert!(get_tags(&out[0]).is_empty());
    assert_eq!(out[1], Value::None);
}

#[test]
fn tagged_none_keeps_its_tags() {
    let mut graph = Graph::with_builtins();
    let boxed = Boxed::none().tagged([("a_tag", Value::number(3.0))]);
    let node = graph.boxed_constant(boxed).unwrap();
    let tag = graph.tag(&node, "a_tag").unwrap();
    assert_eq!(run(&[tag]), [Value::number(3.0)]);
}

#[test]
fn nullable_calls_drop_tags_with_the_value() {
    let mut graph = Graph::with_builtins();
    let list = tagged_pair(&mut graph);
    let five = graph.constant(5.0);
    let missing = graph.call("index", &[list, five]).unwrap();
    let one = graph.constant(1.0);
    let sum = graph.call("add", &[missing, one]).unwrap();
    assert!(weft::is_optional(sum.ty()));

    let out = run(&[sum]);
    assert_eq!(out, [Value::None]);
    assert!(!out[0].is_tagged());
}

#[test]
fn tags_follow_the_first_input_through_picks() {
    let mut graph = Graph::with_builtins();
    let record = Boxed::new(Value::dict([("name", Value::string("w"))])).tagged([("src", Value::string("db"))]);
    let record = graph.boxed_constant(record).unwrap();
    let key = graph.constant("name");
    let name = graph.call("pick", &[record, key]).unwrap();
    let src = graph.tag(&name, "src").unwrap();

    let out = run(&[name, src]);
    assert_eq!(out[0], Value::string("w"));
    assert_eq!(out[1], Value::string("db"));
}

#[test]
fn untracked_tags_are_a_type_error() {
    let mut graph = Graph::with_builtins();
    let plain = graph.constant(1.0);
    assert!(graph.tag(&plain, "a_tag").is_err());
}

#[test]
fn boxing_does_not_change_equality() {
    let a = box_value(Value::string("same"));
    let mut b = box_value(Value::string("same"));
    add_tags(&mut b, [("k", Value::Bool(true))]);
    assert_eq!(a, b);
    assert_eq!(a, Value::string("same"));
    assert_ne!(a.token(), b.token());
}
