// Values saved to the block store stay readable through linked cells,
// including after the store image is reloaded.

use thinlisp::cell::{self, CellHeader};
use thinlisp::store::{attach, persist, BlockInfo};
use thinlisp::{print_to_string, read_from_str, Bistack, BlockStore, CellRef, NvMem, PrintOptions, ReadStatus};

fn read_one(arena: &mut Bistack, text: &str) -> CellRef {
    match read_from_str(arena, text).unwrap() {
        ReadStatus::Done(at) => at,
        ReadStatus::Pending => panic!("incomplete: {:?}", text),
    }
}

#[test]
fn test_attached_list_prints_and_compares() {
    let mut arena = Bistack::new(1024).unwrap();
    let mut mem = NvMem::new(512).unwrap();
    let original = read_one(&mut arena, "(define (sq x) (* x x))");
    let block = persist(&mut arena, &mut mem, original).unwrap();

    let linked = attach(&mut arena, &mem, block).unwrap();
    assert!(cell::load(&arena, &mem, linked).unwrap().is_ptr());
    assert!(cell::equal(&mut arena, &mem, original, linked).unwrap());
    assert_eq!(
        print_to_string(&mut arena, &mem, linked, PrintOptions::compact()).unwrap(),
        "(define (sq x) (* x x))"
    );
}

#[test]
fn test_linked_cell_is_small() {
    let mut arena = Bistack::new(1024).unwrap();
    let mut mem = NvMem::new(512).unwrap();
    let original = read_one(&mut arena, "(a long list (of nested (things)))");
    let full = cell::subtree_len(&mut arena, &mem, original).unwrap();
    let block = persist(&mut arena, &mut mem, original).unwrap();
    let before = arena.forward();
    let linked = attach(&mut arena, &mem, block).unwrap();
    assert!(arena.forward() - before < full);
    // a linked cell spans only its header and address
    let end = cell::advance(&mut arena, &mem, linked).unwrap();
    assert_eq!(end.offset, arena.forward());
}

#[test]
fn test_image_survives_reload() {
    let mut arena = Bistack::new(1024).unwrap();
    let mut mem = NvMem::new(256).unwrap();
    let at = read_one(&mut arena, "(\"stored text\" -99 'sym)");
    let block = persist(&mut arena, &mut mem, at).unwrap();
    let image = mem.image().to_vec();
    drop(mem);

    let mut fresh = Bistack::new(256).unwrap();
    let mem = NvMem::from_image(image).unwrap();
    let linked = attach(&mut fresh, &mem, block).unwrap();
    assert_eq!(
        print_to_string(&mut fresh, &mem, linked, PrintOptions::default()).unwrap(),
        "(\"stored text\" -99 'sym)"
    );
}

#[test]
fn test_atoms_persist() {
    let mut arena = Bistack::new(512).unwrap();
    let mut mem = NvMem::new(256).unwrap();
    let n = read_one(&mut arena, "12345");
    let block = persist(&mut arena, &mut mem, n).unwrap();
    let copy = attach(&mut arena, &mem, block).unwrap();
    assert_eq!(cell::load(&arena, &mem, copy).unwrap(), CellHeader::Integer { value: 12345 });

    let s = read_one(&mut arena, "'quoted-name");
    let block = persist(&mut arena, &mut mem, s).unwrap();
    let linked = attach(&mut arena, &mem, block).unwrap();
    assert!(cell::equal(&mut arena, &mem, s, linked).unwrap());
}

#[test]
fn test_free_returns_space() {
    let mut arena = Bistack::new(512).unwrap();
    let mut mem = NvMem::new(128).unwrap();
    let empty = mem.free_space();
    let at = read_one(&mut arena, "(x y z)");
    let block = persist(&mut arena, &mut mem, at).unwrap();
    assert!(mem.free_space() < empty);
    assert!(mem.blocks().any(|b: BlockInfo| b.address == block && !b.free));
    mem.free(block).unwrap();
    assert_eq!(mem.free_space(), empty);
    let mut out = [0u8; 4];
    assert!(mem.load(block, &mut out).is_err());
}
