use slotidx::SlotIndex;

pub fn main() {
    let dir = tempfile::tempdir().unwrap();
    let mut idx = SlotIndex::open(dir.path().join("records")).expect("should open");

    let a = idx.acquire().unwrap().unwrap();
    let b = idx.acquire().unwrap().unwrap();
    println!("issued slots {} and {}", a, b);

    idx.release(a).unwrap();
    println!("freed slot {}, next up: {:?}", a, idx.next_free().unwrap());

    println!("{} of {} slots reserved", idx.used(), idx.capacity());
    idx.close().expect("should close");
}
