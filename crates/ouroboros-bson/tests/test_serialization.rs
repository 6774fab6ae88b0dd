//! Integration tests for the serialization context: polymorphism, class maps and ids.

use std::any::Any;
use std::sync::Arc;

use ouroboros_bson::serialization::{
    AnyObject, ClassMap, HierarchicalDiscriminatorConvention, SerializationContext, TypeDeclaration,
};
use ouroboros_bson::{doc, bson_array, Bson, BsonError, Document, ObjectId};

trait Shape: Any + Send {
    fn as_any(&self) -> &dyn Any;
    fn area(&self) -> f64;
}

#[derive(Debug, Default, PartialEq)]
struct Circle {
    radius: f64,
}

impl Shape for Circle {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn area(&self) -> f64 {
        std::f64::consts::PI * self.radius * self.radius
    }
}

#[derive(Debug, Default, PartialEq)]
struct Square {
    side: f64,
}

impl Shape for Square {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn area(&self) -> f64 {
        self.side * self.side
    }
}

#[derive(Default)]
struct Drawing {
    title: String,
    shapes: Vec<Box<dyn Shape>>,
}

fn shapes_context() -> Arc<SerializationContext> {
    SerializationContext::builder()
        .declare(TypeDeclaration::<Box<dyn Shape>>::interface(|s| s.as_any()))
        .declare(TypeDeclaration::<Circle>::concrete().extends::<Box<dyn Shape>>(|c| Box::new(c) as Box<dyn Shape>))
        .declare(TypeDeclaration::<Square>::concrete().extends::<Box<dyn Shape>>(|s| Box::new(s) as Box<dyn Shape>))
        .declare(TypeDeclaration::<Vec<Box<dyn Shape>>>::sequence())
        .class_map(ClassMap::<Circle>::new().member("radius", |c| &c.radius, |c, v| c.radius = v))
        .class_map(ClassMap::<Square>::new().member("side", |s| &s.side, |s, v| s.side = v))
        .class_map(
            ClassMap::<Drawing>::new()
                .member("title", |d| &d.title, |d, v| d.title = v)
                .member("shapes", |d| &d.shapes, |d, v| d.shapes = v),
        )
        .build()
        .unwrap()
}

#[test]
fn test_interface_members_round_trip_with_discriminators() {
    let ctx = shapes_context();
    let drawing = Drawing {
        title: "plan".into(),
        shapes: vec![Box::new(Circle { radius: 1.0 }), Box::new(Square { side: 2.0 })],
    };

    let document = ctx.to_document(&drawing).unwrap();
    assert_eq!(
        document,
        doc! {
            "title": "plan",
            "shapes": bson_array![
                doc! { "_t": "Circle", "radius": 1.0 },
                doc! { "_t": "Square", "side": 2.0 },
            ],
        }
    );

    let back: Drawing = ctx.from_document(&document).unwrap();
    assert_eq!(back.title, "plan");
    assert_eq!(back.shapes.len(), 2);
    assert_eq!(back.shapes[0].as_any().downcast_ref::<Circle>(), Some(&Circle { radius: 1.0 }));
    assert_eq!(back.shapes[1].area(), 4.0);
}

#[test]
fn test_concrete_nominal_writes_no_discriminator() {
    let ctx = shapes_context();
    let document = ctx.to_document(&Circle { radius: 3.0 }).unwrap();
    assert_eq!(document, doc! { "radius": 3.0 });
}

#[test]
fn test_unknown_discriminator_fails() {
    let ctx = shapes_context();
    let bytes = doc! { "title": "x", "shapes": bson_array![doc! { "_t": "Hexagon" }] }
        .to_vec()
        .unwrap();
    let err = ctx.from_slice::<Drawing>(&bytes).err().unwrap();
    assert!(matches!(err, BsonError::UnknownDiscriminator { .. }));
}

#[test]
fn test_extra_elements_rejected_unless_ignored() {
    let ctx = shapes_context();
    let err = ctx
        .from_document::<Circle>(&doc! { "radius": 1.0, "color": "red" })
        .err()
        .unwrap();
    assert!(matches!(err, BsonError::UnexpectedElement { ref element, .. } if element == "color"));

    let lenient = SerializationContext::builder()
        .class_map(
            ClassMap::<Circle>::new()
                .member("radius", |c| &c.radius, |c, v| c.radius = v)
                .ignore_extra_elements(true),
        )
        .build()
        .unwrap();
    let circle: Circle = lenient
        .from_document(&doc! { "radius": 1.0, "color": "red" })
        .unwrap();
    assert_eq!(circle.radius, 1.0);
}

#[derive(Debug, Default)]
struct Triangle;

#[derive(Debug, Default)]
struct Polygon;

impl Shape for Triangle {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn area(&self) -> f64 {
        0.0
    }
}

impl Shape for Polygon {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn area(&self) -> f64 {
        0.0
    }
}

#[test]
fn test_shared_discriminator_is_ambiguous() {
    let ctx = SerializationContext::builder()
        .declare(TypeDeclaration::<Box<dyn Shape>>::interface(|s| s.as_any()))
        .declare(
            TypeDeclaration::<Triangle>::concrete()
                .discriminator("poly")
                .extends::<Box<dyn Shape>>(|t| Box::new(t) as Box<dyn Shape>),
        )
        .declare(
            TypeDeclaration::<Polygon>::concrete()
                .discriminator("poly")
                .extends::<Box<dyn Shape>>(|p| Box::new(p) as Box<dyn Shape>),
        )
        .class_map(ClassMap::<Triangle>::new())
        .class_map(ClassMap::<Polygon>::new())
        .build()
        .unwrap();

    let err = ctx
        .from_document::<Box<dyn Shape>>(&doc! { "_t": "poly" })
        .err()
        .unwrap();
    match err {
        BsonError::AmbiguousDiscriminator { candidates, .. } => {
            assert!(candidates.contains("Triangle"));
            assert!(candidates.contains("Polygon"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_any_object_nominal() {
    let ctx = shapes_context();

    let value: AnyObject = Box::new(Circle { radius: 2.0 });
    let document = ctx.to_document(&value).unwrap();
    assert_eq!(document, doc! { "_t": "Circle", "radius": 2.0 });

    let back: AnyObject = ctx.from_document(&document).unwrap();
    assert_eq!(back.downcast_ref::<Circle>(), Some(&Circle { radius: 2.0 }));

    let plain: AnyObject = ctx.from_document(&doc! { "a": 1 }).unwrap();
    assert_eq!(plain.downcast_ref::<Document>(), Some(&doc! { "a": 1 }));
}

#[derive(Debug, Default, PartialEq)]
struct Animal {
    name: String,
    kind: String,
}

#[derive(Debug, Default)]
struct Cat {
    name: String,
}

#[derive(Debug, Default)]
struct Lion {
    name: String,
    pride: i32,
}

fn zoo_context() -> Arc<SerializationContext> {
    SerializationContext::builder()
        .declare(TypeDeclaration::<Animal>::concrete().root_class())
        .declare(TypeDeclaration::<Cat>::concrete().extends::<Animal>(|c| Animal {
            name: c.name,
            kind: "cat".into(),
        }))
        .declare(TypeDeclaration::<Lion>::concrete().extends::<Cat>(|l| Cat { name: l.name }))
        .register_discriminator_convention::<Animal>(Arc::new(HierarchicalDiscriminatorConvention::default()))
        .class_map(
            ClassMap::<Animal>::new()
                .member("name", |a| &a.name, |a, v| a.name = v)
                .member("kind", |a| &a.kind, |a, v| a.kind = v),
        )
        .class_map(ClassMap::<Cat>::new().member("name", |c| &c.name, |c, v| c.name = v))
        .class_map(
            ClassMap::<Lion>::new()
                .member("name", |l| &l.name, |l, v| l.name = v)
                .member("pride", |l| &l.pride, |l, v| l.pride = v),
        )
        .build()
        .unwrap()
}

#[test]
fn test_hierarchical_discriminator_chain() {
    let ctx = zoo_context();
    let lion = Lion {
        name: "Leo".into(),
        pride: 7,
    };

    let mut writer = ouroboros_bson::BsonWriter::new();
    ctx.serialize_nominal(&mut writer, ouroboros_bson::TypeKey::of::<Animal>(), &lion)
        .unwrap();
    let document = Document::from_slice(&writer.into_bytes().unwrap()).unwrap();
    assert_eq!(
        document.get("_t"),
        Some(&bson_array!["Animal", "Cat", "Lion"])
    );

    let animal: Animal = ctx.from_document(&document).unwrap();
    assert_eq!(
        animal,
        Animal {
            name: "Leo".into(),
            kind: "cat".into()
        }
    );
}

#[derive(Debug, Default)]
struct Person {
    id: ObjectId,
    name: String,
}

fn person_context() -> Arc<SerializationContext> {
    SerializationContext::builder()
        .class_map(
            ClassMap::<Person>::new()
                .member("name", |p| &p.name, |p, v| p.name = v)
                .id_member(|p| &p.id, |p, v| p.id = v),
        )
        .build()
        .unwrap()
}

#[test]
fn test_ensure_document_id_generates_once() {
    let ctx = person_context();
    let mut person = Person {
        id: ObjectId::default(),
        name: "Ada".into(),
    };

    assert!(ctx.ensure_document_id(&mut person).unwrap());
    assert!(!person.id.is_empty());
    let first = person.id;
    assert!(!ctx.ensure_document_id(&mut person).unwrap());
    assert_eq!(person.id, first);

    let document = ctx.to_document(&person).unwrap();
    assert_eq!(document.keys().next().map(String::as_str), Some("_id"));
    assert_eq!(document.get_object_id("_id").unwrap(), first);

    let (_, id) = ctx.get_document_id(&person).unwrap().unwrap();
    assert_eq!(id.downcast_ref::<ObjectId>(), Some(&first));
}

#[test]
fn test_serializer_lookup_is_stable_and_locked() {
    let ctx = person_context();
    let a = ctx.lookup_for::<i32>().unwrap();
    let b = ctx.lookup_for::<i32>().unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    let err = ctx.register_serializer::<i32>(a.clone()).unwrap_err();
    assert!(matches!(err, BsonError::DuplicateSerializer(_)));

    let err = ctx.register_serializer::<Document>(a).unwrap_err();
    assert!(matches!(err, BsonError::RegistrationRefused(_)));
}

#[test]
fn test_duplicate_declaration_reported_by_build() {
    let err = SerializationContext::builder()
        .declare(TypeDeclaration::<Circle>::concrete())
        .declare(TypeDeclaration::<Circle>::concrete())
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, BsonError::DuplicateDeclaration(_)));
}

#[test]
fn test_builtin_values_round_trip() {
    let ctx = SerializationContext::builder().build().unwrap();
    let document = doc! {
        "i": 1,
        "l": 2_i64,
        "s": "text",
        "list": bson_array![1, 2],
        "nested": doc! { "ok": true },
        "nothing": Bson::Null,
    };
    let back: Document = ctx.from_slice(&ctx.to_vec(&document).unwrap()).unwrap();
    assert_eq!(back, document);

    let bytes = ctx.to_vec(&Bson::Document(document.clone())).unwrap();
    let value: Bson = ctx.from_slice(&bytes).unwrap();
    assert_eq!(value, Bson::Document(document));
}
